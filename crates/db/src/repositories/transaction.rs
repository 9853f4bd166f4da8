use std::collections::HashMap;

use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use affinity_core::domain::affinity::AffinityKey;
use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::TenantId;
use affinity_core::domain::transaction::{LineItem, OrderId, Transaction, TransactionId};

use super::columns::{encode_timestamp, parse_decimal, parse_literal, parse_timestamp, parse_u32};
use super::{RecordOutcome, RepositoryError, TransactionStore};
use crate::DbPool;

const HEADER_COLUMNS: &str = "t.id, t.tenant_id, t.customer_id, t.order_id, t.order_number,
     t.order_date, t.status, t.is_paid, t.created_at";

const ELIGIBLE: &str = "t.is_paid = 1 AND t.status NOT IN ('cancelled', 'refunded')";

pub struct SqlTransactionStore {
    pool: DbPool,
}

impl SqlTransactionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn hydrate(
        &self,
        tenant_id: &TenantId,
        headers: Vec<SqliteRow>,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let mut transactions =
            headers.into_iter().map(header_from_row).collect::<Result<Vec<_>, _>>()?;

        let mut query_builder = QueryBuilder::<Sqlite>::new(
            "SELECT transaction_id, product_id, product_name, category, quantity, unit_price, total_price
             FROM sales_transaction_item
             WHERE tenant_id = ",
        );
        query_builder.push_bind(tenant_id.0.clone());
        query_builder.push(" AND transaction_id IN (");
        let mut separated = query_builder.separated(", ");
        for transaction in &transactions {
            separated.push_bind(transaction.id.0.clone());
        }
        separated.push_unseparated(") ORDER BY transaction_id ASC, line_no ASC");

        let rows = query_builder.build().fetch_all(&self.pool).await?;
        let mut items_by_transaction: HashMap<String, Vec<LineItem>> = HashMap::new();
        for row in rows {
            let transaction_id: String = row.try_get("transaction_id")?;
            items_by_transaction.entry(transaction_id).or_default().push(item_from_row(&row)?);
        }

        for transaction in &mut transactions {
            transaction.items = items_by_transaction.remove(&transaction.id.0).unwrap_or_default();
        }

        Ok(transactions)
    }
}

#[async_trait::async_trait]
impl TransactionStore for SqlTransactionStore {
    async fn record(&self, transaction: Transaction) -> Result<RecordOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO sales_transaction (
                id,
                tenant_id,
                customer_id,
                order_id,
                order_number,
                order_date,
                status,
                is_paid,
                total_amount,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, order_id) DO NOTHING",
        )
        .bind(&transaction.id.0)
        .bind(&transaction.tenant_id.0)
        .bind(&transaction.customer_id.0)
        .bind(&transaction.order_id.0)
        .bind(&transaction.order_number)
        .bind(encode_timestamp(transaction.order_date))
        .bind(transaction.status.as_str())
        .bind(transaction.is_paid)
        .bind(transaction.total_amount().to_string())
        .bind(encode_timestamp(transaction.created_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let existing: String = sqlx::query_scalar(
                "SELECT id FROM sales_transaction WHERE tenant_id = ? AND order_id = ?",
            )
            .bind(&transaction.tenant_id.0)
            .bind(&transaction.order_id.0)
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(RecordOutcome::Duplicate { existing: TransactionId(existing) });
        }

        for (line_no, item) in transaction.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO sales_transaction_item (
                    tenant_id,
                    transaction_id,
                    line_no,
                    product_id,
                    product_name,
                    category,
                    quantity,
                    unit_price,
                    total_price
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&transaction.tenant_id.0)
            .bind(&transaction.id.0)
            .bind(i64::try_from(line_no).unwrap_or(i64::MAX))
            .bind(&item.product_id.0)
            .bind(&item.product_name)
            .bind(item.category.as_deref())
            .bind(i64::from(item.quantity))
            .bind(item.unit_price.to_string())
            .bind(item.total_price.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(RecordOutcome::Recorded)
    }

    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS} FROM sales_transaction t WHERE t.tenant_id = ? AND t.id = ?"
        ))
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(self.hydrate(tenant_id, row.into_iter().collect()).await?.pop())
    }

    async fn find_by_order(
        &self,
        tenant_id: &TenantId,
        order_id: &OrderId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS} FROM sales_transaction t
             WHERE t.tenant_id = ? AND t.order_id = ?"
        ))
        .bind(&tenant_id.0)
        .bind(&order_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(self.hydrate(tenant_id, row.into_iter().collect()).await?.pop())
    }

    async fn eligible_purchases(
        &self,
        key: &AffinityKey,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS} FROM sales_transaction t
             WHERE t.tenant_id = ?
               AND t.customer_id = ?
               AND {ELIGIBLE}
               AND EXISTS (
                    SELECT 1 FROM sales_transaction_item i
                    WHERE i.tenant_id = t.tenant_id
                      AND i.transaction_id = t.id
                      AND i.product_id = ?
               )
             ORDER BY t.order_date ASC, t.id ASC"
        ))
        .bind(&key.tenant_id.0)
        .bind(&key.customer_id.0)
        .bind(&key.product_id.0)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(&key.tenant_id, rows).await
    }

    async fn eligible_pairs(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<(CustomerId, ProductId)>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT t.customer_id, i.product_id
             FROM sales_transaction t
             JOIN sales_transaction_item i
               ON i.tenant_id = t.tenant_id AND i.transaction_id = t.id
             WHERE t.tenant_id = ? AND {ELIGIBLE}
             ORDER BY t.customer_id ASC, i.product_id ASC"
        ))
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok((CustomerId(row.try_get("customer_id")?), ProductId(row.try_get("product_id")?)))
            })
            .collect()
    }
}

fn header_from_row(row: SqliteRow) -> Result<Transaction, RepositoryError> {
    Ok(Transaction {
        id: TransactionId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        customer_id: CustomerId(row.try_get("customer_id")?),
        order_id: OrderId(row.try_get("order_id")?),
        order_number: row.try_get("order_number")?,
        order_date: parse_timestamp("order_date", row.try_get("order_date")?)?,
        status: parse_literal(row.try_get("status")?)?,
        is_paid: row.try_get("is_paid")?,
        items: Vec::new(),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<LineItem, RepositoryError> {
    Ok(LineItem {
        product_id: ProductId(row.try_get("product_id")?),
        product_name: row.try_get("product_name")?,
        category: row.try_get("category")?,
        quantity: parse_u32("quantity", row.try_get("quantity")?)?,
        unit_price: parse_decimal("unit_price", row.try_get("unit_price")?)?,
        total_price: parse_decimal("total_price", row.try_get("total_price")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use affinity_core::domain::affinity::AffinityKey;
    use affinity_core::domain::customer::CustomerId;
    use affinity_core::domain::product::ProductId;
    use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};
    use affinity_core::domain::transaction::{
        LineItem, OrderId, Transaction, TransactionId, TransactionStatus,
    };

    use super::SqlTransactionStore;
    use crate::repositories::{
        RecordOutcome, SqlTenantDirectory, TenantDirectory, TransactionStore,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        SqlTenantDirectory::new(pool.clone())
            .save(Tenant {
                id: TenantId("tenant-a".to_string()),
                name: "Tenant A".to_string(),
                status: TenantStatus::Active,
                created_at: parse_ts("2026-01-01T00:00:00Z"),
            })
            .await
            .expect("save tenant");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn line(product: &str, quantity: u32, cents: i64) -> LineItem {
        LineItem {
            product_id: ProductId(product.to_string()),
            product_name: format!("{product} name"),
            category: Some("pantry".to_string()),
            quantity,
            unit_price: Decimal::new(cents, 2),
            total_price: Decimal::new(cents * i64::from(quantity), 2),
        }
    }

    fn transaction(id: &str, customer: &str, day: i64, paid: bool, items: Vec<LineItem>) -> Transaction {
        let base = parse_ts("2026-02-01T09:30:00Z");
        Transaction {
            id: TransactionId(id.to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            customer_id: CustomerId(customer.to_string()),
            order_id: OrderId(format!("order-{id}")),
            order_number: id.to_uppercase(),
            order_date: base + Duration::days(day),
            status: TransactionStatus::Completed,
            is_paid: paid,
            items,
            created_at: base,
        }
    }

    #[tokio::test]
    async fn record_round_trips_and_is_idempotent_by_order() {
        let pool = setup_pool().await;
        let store = SqlTransactionStore::new(pool.clone());
        let original =
            transaction("tx-1", "c-1", 0, true, vec![line("rice", 2, 350), line("beans", 1, 199)]);

        let outcome = store.record(original.clone()).await.expect("record");
        assert_eq!(outcome, RecordOutcome::Recorded);

        let mut replay = original.clone();
        replay.id = TransactionId("tx-1-replay".to_string());
        let outcome = store.record(replay).await.expect("record replay");
        assert_eq!(
            outcome,
            RecordOutcome::Duplicate { existing: TransactionId("tx-1".to_string()) }
        );

        let found = store
            .find_by_id(&original.tenant_id, &original.id)
            .await
            .expect("find by id");
        assert_eq!(found, Some(original.clone()));

        let by_order = store
            .find_by_order(&original.tenant_id, &original.order_id)
            .await
            .expect("find by order");
        assert_eq!(by_order.map(|tx| tx.id), Some(original.id));

        pool.close().await;
    }

    #[tokio::test]
    async fn eligible_queries_skip_unpaid_and_sort_by_date() {
        let pool = setup_pool().await;
        let store = SqlTransactionStore::new(pool.clone());

        for tx in [
            transaction("tx-3", "c-1", 20, true, vec![line("rice", 1, 350)]),
            transaction("tx-1", "c-1", 0, true, vec![line("rice", 1, 350), line("oil", 1, 800)]),
            transaction("tx-2", "c-1", 10, false, vec![line("rice", 5, 350)]),
            transaction("tx-4", "c-2", 3, true, vec![line("oil", 1, 800)]),
        ] {
            store.record(tx).await.expect("record");
        }

        let key = AffinityKey::new(
            TenantId("tenant-a".to_string()),
            CustomerId("c-1".to_string()),
            ProductId("rice".to_string()),
        );
        let purchases = store.eligible_purchases(&key).await.expect("purchases");
        let ids: Vec<&str> = purchases.iter().map(|tx| tx.id.0.as_str()).collect();
        assert_eq!(ids, vec!["tx-1", "tx-3"]);
        assert_eq!(purchases[0].items.len(), 2);

        let pairs = store.eligible_pairs(&TenantId("tenant-a".to_string())).await.expect("pairs");
        let pairs: Vec<(&str, &str)> =
            pairs.iter().map(|(c, p)| (c.0.as_str(), p.0.as_str())).collect();
        assert_eq!(pairs, vec![("c-1", "oil"), ("c-1", "rice"), ("c-2", "oil")]);

        pool.close().await;
    }

    #[tokio::test]
    async fn transaction_ids_are_scoped_per_tenant() {
        let pool = setup_pool().await;
        SqlTenantDirectory::new(pool.clone())
            .save(Tenant {
                id: TenantId("tenant-b".to_string()),
                name: "Tenant B".to_string(),
                status: TenantStatus::Active,
                created_at: parse_ts("2026-01-01T00:00:00Z"),
            })
            .await
            .expect("save second tenant");
        let store = SqlTransactionStore::new(pool.clone());

        let first = transaction("tx-shared", "c-1", 0, true, vec![line("rice", 2, 350)]);
        let mut second = transaction("tx-shared", "c-9", 4, true, vec![line("oil", 1, 800)]);
        second.tenant_id = TenantId("tenant-b".to_string());
        second.order_id = OrderId("order-from-b".to_string());

        assert_eq!(store.record(first.clone()).await.expect("record a"), RecordOutcome::Recorded);
        assert_eq!(store.record(second.clone()).await.expect("record b"), RecordOutcome::Recorded);

        let found_a = store.find_by_id(&first.tenant_id, &first.id).await.expect("find a");
        let found_b = store.find_by_id(&second.tenant_id, &second.id).await.expect("find b");
        assert_eq!(found_a, Some(first));
        assert_eq!(found_b, Some(second));

        let pairs = store.eligible_pairs(&TenantId("tenant-b".to_string())).await.expect("pairs");
        assert_eq!(pairs, vec![(CustomerId("c-9".to_string()), ProductId("oil".to_string()))]);

        pool.close().await;
    }
}
