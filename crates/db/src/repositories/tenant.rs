use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};

use super::columns::{encode_timestamp, parse_literal, parse_timestamp};
use super::{RepositoryError, TenantDirectory};
use crate::DbPool;

pub struct SqlTenantDirectory {
    pool: DbPool,
}

impl SqlTenantDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TenantDirectory for SqlTenantDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, status, created_at FROM tenant WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(tenant_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        statuses: &[TenantStatus],
    ) -> Result<Vec<Tenant>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_builder =
            QueryBuilder::<Sqlite>::new("SELECT id, name, status, created_at FROM tenant WHERE status IN (");
        let mut separated = query_builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(") ORDER BY id ASC");

        let rows = query_builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(tenant_from_row).collect()
    }

    async fn save(&self, tenant: Tenant) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO tenant (id, name, status, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status",
        )
        .bind(&tenant.id.0)
        .bind(&tenant.name)
        .bind(tenant.status.as_str())
        .bind(encode_timestamp(tenant.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn tenant_from_row(row: SqliteRow) -> Result<Tenant, RepositoryError> {
    Ok(Tenant {
        id: TenantId(row.try_get("id")?),
        name: row.try_get("name")?,
        status: parse_literal(row.try_get("status")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};

    use super::SqlTenantDirectory;
    use crate::repositories::TenantDirectory;
    use crate::{connect_with_settings, migrations};

    fn tenant(id: &str, status: TenantStatus) -> Tenant {
        Tenant {
            id: TenantId(id.to_string()),
            name: format!("Tenant {id}"),
            status,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid date"),
        }
    }

    #[tokio::test]
    async fn list_by_status_filters_and_orders_by_id() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let directory = SqlTenantDirectory::new(pool.clone());

        for tenant in [
            tenant("t-3", TenantStatus::Trial),
            tenant("t-1", TenantStatus::Active),
            tenant("t-2", TenantStatus::Suspended),
        ] {
            directory.save(tenant).await.expect("save tenant");
        }

        let eligible = directory
            .list_by_status(&[TenantStatus::Active, TenantStatus::Trial])
            .await
            .expect("list tenants");
        let ids: Vec<&str> = eligible.iter().map(|tenant| tenant.id.0.as_str()).collect();
        assert_eq!(ids, vec!["t-1", "t-3"]);

        assert!(directory.list_by_status(&[]).await.expect("empty filter").is_empty());

        let found = directory.find_by_id(&TenantId("t-2".to_string())).await.expect("find");
        assert_eq!(found, Some(tenant("t-2", TenantStatus::Suspended)));

        pool.close().await;
    }
}
