pub mod config;
pub mod domain;
pub mod errors;
pub mod scoring;

pub use domain::affinity::{
    AffinityKey, CacheQuery, CustomerProductAffinity, CustomerSegment, EngagementLevel,
    PurchaseTrend,
};
pub use domain::customer::CustomerId;
pub use domain::matrix::{CoPurchasePattern, CustomerPurchaseRecord, ProductAffinityMatrix};
pub use domain::product::ProductId;
pub use domain::tenant::{Tenant, TenantId, TenantStatus};
pub use domain::transaction::{
    LineItem, OrderId, ProductContribution, Transaction, TransactionId, TransactionStatus,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use scoring::{AffinityScorer, PurchaseHistory, ScoreBreakdown, ScoreInput, ScoringConfig};
