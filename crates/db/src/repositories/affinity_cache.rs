use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use affinity_core::domain::affinity::{AffinityKey, CacheQuery, CustomerProductAffinity};
use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::TenantId;

use super::columns::{
    encode_timestamp, encode_u64, parse_decimal, parse_literal, parse_optional_timestamp,
    parse_timestamp, parse_u32, parse_u64,
};
use super::{AffinityCacheRepository, RepositoryError};
use crate::DbPool;

const CACHE_COLUMNS: &str = "SELECT
        tenant_id,
        customer_id,
        product_id,
        product_name,
        product_category,
        purchase_count,
        total_quantity_purchased,
        total_spent,
        average_quantity,
        average_order_value,
        first_purchase_date,
        last_purchase_date,
        exact_frequency_days,
        days_since_last_purchase,
        affinity_score,
        customer_segment,
        engagement_level,
        next_predicted_purchase_date,
        purchase_trend,
        last_calculated
     FROM customer_product_affinity
     WHERE tenant_id = ";

enum Scope<'a> {
    Tenant,
    Customer(&'a CustomerId),
    Product(&'a ProductId),
}

pub struct SqlAffinityCacheRepository {
    pool: DbPool,
}

impl SqlAffinityCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn list(
        &self,
        tenant_id: &TenantId,
        scope: Scope<'_>,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(CACHE_COLUMNS);
        builder.push_bind(tenant_id.0.clone());

        match scope {
            Scope::Tenant => {}
            Scope::Customer(customer_id) => {
                builder.push(" AND customer_id = ").push_bind(customer_id.0.clone());
            }
            Scope::Product(product_id) => {
                builder.push(" AND product_id = ").push_bind(product_id.0.clone());
            }
        }

        push_filters(&mut builder, query);
        builder.push(" ORDER BY affinity_score DESC, customer_id ASC, product_id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(affinity_from_row).collect()
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &CacheQuery) {
    if let Some(min_score) = query.min_score {
        builder.push(" AND affinity_score >= ").push_bind(i64::from(min_score));
    }
    if let Some(max_score) = query.max_score {
        builder.push(" AND affinity_score <= ").push_bind(i64::from(max_score));
    }
    if let Some(segment) = query.segment {
        builder.push(" AND customer_segment = ").push_bind(segment.as_str());
    }
    if !query.engagement_levels.is_empty() {
        builder.push(" AND engagement_level IN (");
        let mut separated = builder.separated(", ");
        for level in &query.engagement_levels {
            separated.push_bind(level.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(category) = &query.category {
        builder.push(" AND product_category = ").push_bind(category.clone());
    }
    if let Some(min_frequency_days) = query.min_frequency_days {
        builder.push(" AND exact_frequency_days >= ").push_bind(min_frequency_days);
    }
    if let Some(bound) = query.predicted_before {
        builder.push(" AND next_predicted_purchase_date < ").push_bind(encode_timestamp(bound));
    }
    if let Some(bound) = query.predicted_on_or_before {
        builder.push(" AND next_predicted_purchase_date <= ").push_bind(encode_timestamp(bound));
    }
    if let Some(bound) = query.predicted_on_or_after {
        builder.push(" AND next_predicted_purchase_date >= ").push_bind(encode_timestamp(bound));
    }
}

#[async_trait::async_trait]
impl AffinityCacheRepository for SqlAffinityCacheRepository {
    async fn find(
        &self,
        key: &AffinityKey,
    ) -> Result<Option<CustomerProductAffinity>, RepositoryError> {
        let row = sqlx::query(&format!("{CACHE_COLUMNS} ? AND customer_id = ? AND product_id = ?"))
            .bind(&key.tenant_id.0)
            .bind(&key.customer_id.0)
            .bind(&key.product_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(affinity_from_row).transpose()
    }

    async fn upsert(&self, affinity: &CustomerProductAffinity) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO customer_product_affinity (
                tenant_id,
                customer_id,
                product_id,
                product_name,
                product_category,
                purchase_count,
                total_quantity_purchased,
                total_spent,
                average_quantity,
                average_order_value,
                first_purchase_date,
                last_purchase_date,
                exact_frequency_days,
                days_since_last_purchase,
                affinity_score,
                customer_segment,
                engagement_level,
                next_predicted_purchase_date,
                purchase_trend,
                last_calculated
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, customer_id, product_id) DO UPDATE SET
                product_name = excluded.product_name,
                product_category = excluded.product_category,
                purchase_count = excluded.purchase_count,
                total_quantity_purchased = excluded.total_quantity_purchased,
                total_spent = excluded.total_spent,
                average_quantity = excluded.average_quantity,
                average_order_value = excluded.average_order_value,
                first_purchase_date = excluded.first_purchase_date,
                last_purchase_date = excluded.last_purchase_date,
                exact_frequency_days = excluded.exact_frequency_days,
                days_since_last_purchase = excluded.days_since_last_purchase,
                affinity_score = excluded.affinity_score,
                customer_segment = excluded.customer_segment,
                engagement_level = excluded.engagement_level,
                next_predicted_purchase_date = excluded.next_predicted_purchase_date,
                purchase_trend = excluded.purchase_trend,
                last_calculated = excluded.last_calculated",
        )
        .bind(&affinity.key.tenant_id.0)
        .bind(&affinity.key.customer_id.0)
        .bind(&affinity.key.product_id.0)
        .bind(&affinity.product_name)
        .bind(affinity.product_category.as_deref())
        .bind(i64::from(affinity.purchase_count))
        .bind(encode_u64("total_quantity_purchased", affinity.total_quantity_purchased)?)
        .bind(affinity.total_spent.to_string())
        .bind(affinity.average_quantity)
        .bind(affinity.average_order_value.to_string())
        .bind(encode_timestamp(affinity.first_purchase_date))
        .bind(encode_timestamp(affinity.last_purchase_date))
        .bind(affinity.exact_frequency_days)
        .bind(affinity.days_since_last_purchase)
        .bind(i64::from(affinity.affinity_score))
        .bind(affinity.customer_segment.as_str())
        .bind(affinity.engagement_level.as_str())
        .bind(affinity.next_predicted_purchase_date.map(encode_timestamp))
        .bind(affinity.purchase_trend.map(|trend| trend.as_str()))
        .bind(encode_timestamp(affinity.last_calculated))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        self.list(tenant_id, Scope::Customer(customer_id), query).await
    }

    async fn list_for_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        self.list(tenant_id, Scope::Product(product_id), query).await
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        self.list(tenant_id, Scope::Tenant, query).await
    }
}

fn affinity_from_row(row: SqliteRow) -> Result<CustomerProductAffinity, RepositoryError> {
    Ok(CustomerProductAffinity {
        key: AffinityKey::new(
            TenantId(row.try_get("tenant_id")?),
            CustomerId(row.try_get("customer_id")?),
            ProductId(row.try_get("product_id")?),
        ),
        product_name: row.try_get("product_name")?,
        product_category: row.try_get("product_category")?,
        purchase_count: parse_u32("purchase_count", row.try_get("purchase_count")?)?,
        total_quantity_purchased: parse_u64(
            "total_quantity_purchased",
            row.try_get("total_quantity_purchased")?,
        )?,
        total_spent: parse_decimal("total_spent", row.try_get("total_spent")?)?,
        average_quantity: row.try_get("average_quantity")?,
        average_order_value: parse_decimal(
            "average_order_value",
            row.try_get("average_order_value")?,
        )?,
        first_purchase_date: parse_timestamp(
            "first_purchase_date",
            row.try_get("first_purchase_date")?,
        )?,
        last_purchase_date: parse_timestamp(
            "last_purchase_date",
            row.try_get("last_purchase_date")?,
        )?,
        exact_frequency_days: row.try_get("exact_frequency_days")?,
        days_since_last_purchase: row.try_get("days_since_last_purchase")?,
        affinity_score: parse_u32("affinity_score", row.try_get("affinity_score")?)?,
        customer_segment: parse_literal(row.try_get("customer_segment")?)?,
        engagement_level: parse_literal(row.try_get("engagement_level")?)?,
        next_predicted_purchase_date: parse_optional_timestamp(
            "next_predicted_purchase_date",
            row.try_get("next_predicted_purchase_date")?,
        )?,
        purchase_trend: row
            .try_get::<Option<String>, _>("purchase_trend")?
            .map(parse_literal)
            .transpose()?,
        last_calculated: parse_timestamp("last_calculated", row.try_get("last_calculated")?)?,
    })
}
