use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::RwLock;

use affinity_core::domain::affinity::{AffinityKey, CacheQuery, CustomerProductAffinity};
use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::matrix::ProductAffinityMatrix;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};
use affinity_core::domain::transaction::{OrderId, Transaction, TransactionId};

use super::{
    AffinityCacheRepository, MatrixRepository, RecordOutcome, RepositoryError, SaveOutcome,
    TenantDirectory, TransactionStore,
};

#[derive(Default)]
pub struct InMemoryTransactionStore {
    transactions: RwLock<Vec<Transaction>>,
}

impl InMemoryTransactionStore {
    /// Drops a recorded transaction. The trait is append-only; this exists so
    /// tests can simulate history disappearing underneath the cache.
    pub async fn remove(&self, tenant_id: &TenantId, id: &TransactionId) -> bool {
        let mut transactions = self.transactions.write().await;
        let before = transactions.len();
        transactions.retain(|entry| !(&entry.tenant_id == tenant_id && &entry.id == id));
        transactions.len() != before
    }
}

#[async_trait::async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn record(&self, transaction: Transaction) -> Result<RecordOutcome, RepositoryError> {
        let mut transactions = self.transactions.write().await;
        if let Some(existing) = transactions.iter().find(|entry| {
            entry.tenant_id == transaction.tenant_id && entry.order_id == transaction.order_id
        }) {
            return Ok(RecordOutcome::Duplicate { existing: existing.id.clone() });
        }
        transactions.push(transaction);
        Ok(RecordOutcome::Recorded)
    }

    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .iter()
            .find(|entry| &entry.tenant_id == tenant_id && &entry.id == id)
            .cloned())
    }

    async fn find_by_order(
        &self,
        tenant_id: &TenantId,
        order_id: &OrderId,
    ) -> Result<Option<Transaction>, RepositoryError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .iter()
            .find(|entry| &entry.tenant_id == tenant_id && &entry.order_id == order_id)
            .cloned())
    }

    async fn eligible_purchases(
        &self,
        key: &AffinityKey,
    ) -> Result<Vec<Transaction>, RepositoryError> {
        let transactions = self.transactions.read().await;
        let mut matching: Vec<Transaction> = transactions
            .iter()
            .filter(|entry| {
                entry.tenant_id == key.tenant_id
                    && entry.customer_id == key.customer_id
                    && entry.is_eligible()
                    && entry.contains_product(&key.product_id)
            })
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            left.order_date.cmp(&right.order_date).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }

    async fn eligible_pairs(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<(CustomerId, ProductId)>, RepositoryError> {
        let transactions = self.transactions.read().await;
        let pairs: BTreeSet<(CustomerId, ProductId)> = transactions
            .iter()
            .filter(|entry| &entry.tenant_id == tenant_id && entry.is_eligible())
            .flat_map(|entry| {
                entry.items.iter().map(|item| (entry.customer_id.clone(), item.product_id.clone()))
            })
            .collect();
        Ok(pairs.into_iter().collect())
    }
}

#[derive(Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<BTreeMap<TenantId, Tenant>>,
}

#[async_trait::async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(id).cloned())
    }

    async fn list_by_status(
        &self,
        statuses: &[TenantStatus],
    ) -> Result<Vec<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.values().filter(|tenant| statuses.contains(&tenant.status)).cloned().collect())
    }

    async fn save(&self, tenant: Tenant) -> Result<(), RepositoryError> {
        let mut tenants = self.tenants.write().await;
        tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMatrixRepository {
    matrices: RwLock<BTreeMap<(TenantId, ProductId), ProductAffinityMatrix>>,
}

#[async_trait::async_trait]
impl MatrixRepository for InMemoryMatrixRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<Option<ProductAffinityMatrix>, RepositoryError> {
        let matrices = self.matrices.read().await;
        Ok(matrices.get(&(tenant_id.clone(), product_id.clone())).cloned())
    }

    async fn save(
        &self,
        matrix: &ProductAffinityMatrix,
        expected_version: i64,
    ) -> Result<SaveOutcome, RepositoryError> {
        let mut matrices = self.matrices.write().await;
        let key = (matrix.tenant_id.clone(), matrix.product_id.clone());
        let stored_version = matrices.get(&key).map_or(0, |stored| stored.version);
        if stored_version != expected_version {
            return Ok(SaveOutcome::VersionConflict);
        }

        let version = expected_version + 1;
        matrices.insert(key, ProductAffinityMatrix { version, ..matrix.clone() });
        Ok(SaveOutcome::Saved { version })
    }

    async fn find_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<ProductAffinityMatrix>, RepositoryError> {
        let matrices = self.matrices.read().await;
        Ok(matrices
            .values()
            .filter(|matrix| {
                &matrix.tenant_id == tenant_id && matrix.customer_ids.contains(customer_id)
            })
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<bool, RepositoryError> {
        let mut matrices = self.matrices.write().await;
        Ok(matrices.remove(&(tenant_id.clone(), product_id.clone())).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryAffinityCacheRepository {
    entries: RwLock<HashMap<AffinityKey, CustomerProductAffinity>>,
}

impl InMemoryAffinityCacheRepository {
    async fn list_where(
        &self,
        query: &CacheQuery,
        scope: impl Fn(&AffinityKey) -> bool,
    ) -> Vec<CustomerProductAffinity> {
        let entries = self.entries.read().await;
        let mut selected: Vec<CustomerProductAffinity> = entries
            .values()
            .filter(|entry| scope(&entry.key) && query.matches(entry))
            .cloned()
            .collect();
        selected.sort_by(|left, right| {
            right
                .affinity_score
                .cmp(&left.affinity_score)
                .then_with(|| left.key.customer_id.cmp(&right.key.customer_id))
                .then_with(|| left.key.product_id.cmp(&right.key.product_id))
        });
        selected
    }
}

#[async_trait::async_trait]
impl AffinityCacheRepository for InMemoryAffinityCacheRepository {
    async fn find(
        &self,
        key: &AffinityKey,
    ) -> Result<Option<CustomerProductAffinity>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn upsert(&self, affinity: &CustomerProductAffinity) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert(affinity.key.clone(), affinity.clone());
        Ok(())
    }

    async fn list_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        Ok(self
            .list_where(query, |key| {
                &key.tenant_id == tenant_id && &key.customer_id == customer_id
            })
            .await)
    }

    async fn list_for_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        Ok(self
            .list_where(query, |key| &key.tenant_id == tenant_id && &key.product_id == product_id)
            .await)
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
        Ok(self.list_where(query, |key| &key.tenant_id == tenant_id).await)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use affinity_core::domain::customer::CustomerId;
    use affinity_core::domain::matrix::ProductAffinityMatrix;
    use affinity_core::domain::product::ProductId;
    use affinity_core::domain::tenant::TenantId;
    use affinity_core::domain::transaction::{
        LineItem, OrderId, Transaction, TransactionId, TransactionStatus,
    };

    use crate::repositories::{
        InMemoryMatrixRepository, InMemoryTransactionStore, MatrixRepository, RecordOutcome,
        SaveOutcome, TransactionStore,
    };

    fn transaction(id: &str, order: &str, day: i64, is_paid: bool) -> Transaction {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).single().expect("valid date");
        Transaction {
            id: TransactionId(id.to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            customer_id: CustomerId("c-1".to_string()),
            order_id: OrderId(order.to_string()),
            order_number: order.to_uppercase(),
            order_date: base + Duration::days(day),
            status: TransactionStatus::Completed,
            is_paid,
            items: vec![LineItem {
                product_id: ProductId("tea".to_string()),
                product_name: "Tea".to_string(),
                category: None,
                quantity: 1,
                unit_price: Decimal::new(300, 2),
                total_price: Decimal::new(300, 2),
            }],
            created_at: base,
        }
    }

    #[tokio::test]
    async fn transaction_store_dedupes_orders_and_filters_eligibility() {
        let store = InMemoryTransactionStore::default();
        assert_eq!(
            store.record(transaction("tx-2", "o-2", 5, true)).await.expect("record"),
            RecordOutcome::Recorded
        );
        store.record(transaction("tx-1", "o-1", 1, true)).await.expect("record");
        store.record(transaction("tx-3", "o-3", 9, false)).await.expect("record");

        let duplicate = store.record(transaction("tx-9", "o-1", 1, true)).await.expect("record");
        assert_eq!(
            duplicate,
            RecordOutcome::Duplicate { existing: TransactionId("tx-1".to_string()) }
        );

        let key = affinity_core::domain::affinity::AffinityKey::new(
            TenantId("tenant-a".to_string()),
            CustomerId("c-1".to_string()),
            ProductId("tea".to_string()),
        );
        let purchases = store.eligible_purchases(&key).await.expect("purchases");
        let ids: Vec<&str> = purchases.iter().map(|entry| entry.id.0.as_str()).collect();
        assert_eq!(ids, vec!["tx-1", "tx-2"]);

        assert!(store.remove(&key.tenant_id, &TransactionId("tx-1".to_string())).await);
        assert_eq!(store.eligible_purchases(&key).await.expect("purchases").len(), 1);
    }

    #[tokio::test]
    async fn matrix_repository_enforces_versions() {
        let repo = InMemoryMatrixRepository::default();
        let tenant = TenantId("tenant-a".to_string());
        let mut matrix = ProductAffinityMatrix::new(
            tenant.clone(),
            ProductId("tea".to_string()),
            "Tea",
            Utc::now(),
        );
        matrix.customer_ids.push(CustomerId("c-1".to_string()));

        assert_eq!(repo.save(&matrix, 0).await.expect("save"), SaveOutcome::Saved { version: 1 });
        assert_eq!(repo.save(&matrix, 0).await.expect("save"), SaveOutcome::VersionConflict);

        let stored = repo.find(&tenant, &matrix.product_id).await.expect("find").expect("stored");
        assert_eq!(stored.version, 1);

        let for_customer = repo
            .find_for_customer(&tenant, &CustomerId("c-1".to_string()))
            .await
            .expect("reverse lookup");
        assert_eq!(for_customer.len(), 1);

        assert!(repo.delete(&tenant, &matrix.product_id).await.expect("delete"));
        assert!(repo.find(&tenant, &matrix.product_id).await.expect("find").is_none());
    }
}
