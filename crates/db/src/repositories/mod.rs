use async_trait::async_trait;
use thiserror::Error;

use affinity_core::domain::affinity::{AffinityKey, CacheQuery, CustomerProductAffinity};
use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::matrix::ProductAffinityMatrix;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};
use affinity_core::domain::transaction::{OrderId, Transaction, TransactionId};

pub mod affinity_cache;
mod columns;
pub mod matrix;
pub mod memory;
pub mod tenant;
pub mod transaction;

pub use affinity_cache::SqlAffinityCacheRepository;
pub use matrix::SqlMatrixRepository;
pub use memory::{
    InMemoryAffinityCacheRepository, InMemoryMatrixRepository, InMemoryTenantDirectory,
    InMemoryTransactionStore,
};
pub use tenant::SqlTenantDirectory;
pub use transaction::SqlTransactionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The order was already recorded for this tenant under `existing`.
    Duplicate { existing: TransactionId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { version: i64 },
    /// The stored version no longer matches the one the caller loaded.
    VersionConflict,
}

/// Append-only store of purchase events. Records are never mutated.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Records `transaction` unless the same `(tenant, order_id)` exists.
    async fn record(&self, transaction: Transaction) -> Result<RecordOutcome, RepositoryError>;

    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, RepositoryError>;

    async fn find_by_order(
        &self,
        tenant_id: &TenantId,
        order_id: &OrderId,
    ) -> Result<Option<Transaction>, RepositoryError>;

    /// Eligible transactions of the key's customer that contain the key's
    /// product, oldest first.
    async fn eligible_purchases(
        &self,
        key: &AffinityKey,
    ) -> Result<Vec<Transaction>, RepositoryError>;

    /// Distinct `(customer, product)` pairs found in eligible transactions,
    /// ordered by customer then product.
    async fn eligible_pairs(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<(CustomerId, ProductId)>, RepositoryError>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError>;

    /// Tenants whose status is in `statuses`, ordered by id.
    async fn list_by_status(
        &self,
        statuses: &[TenantStatus],
    ) -> Result<Vec<Tenant>, RepositoryError>;

    async fn save(&self, tenant: Tenant) -> Result<(), RepositoryError>;
}

/// Product-centric matrices with compare-and-swap writes.
#[async_trait]
pub trait MatrixRepository: Send + Sync {
    async fn find(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<Option<ProductAffinityMatrix>, RepositoryError>;

    /// Writes `matrix` if the stored version equals `expected_version`
    /// (`0` means the matrix must not exist yet). The new version is
    /// `expected_version + 1`.
    async fn save(
        &self,
        matrix: &ProductAffinityMatrix,
        expected_version: i64,
    ) -> Result<SaveOutcome, RepositoryError>;

    /// Matrices whose reverse index lists `customer_id`, ordered by product id.
    async fn find_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<ProductAffinityMatrix>, RepositoryError>;

    async fn delete(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<bool, RepositoryError>;
}

/// Customer-product cache. Entries are replaced whole and never deleted.
#[async_trait]
pub trait AffinityCacheRepository: Send + Sync {
    async fn find(
        &self,
        key: &AffinityKey,
    ) -> Result<Option<CustomerProductAffinity>, RepositoryError>;

    async fn upsert(&self, affinity: &CustomerProductAffinity) -> Result<(), RepositoryError>;

    async fn list_for_customer(
        &self,
        tenant_id: &TenantId,
        customer_id: &CustomerId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError>;

    async fn list_for_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError>;

    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
        query: &CacheQuery,
    ) -> Result<Vec<CustomerProductAffinity>, RepositoryError>;
}
