//! Affinity engine: everything that moves data through the affinity index.
//!
//! - [`recorder`] records completed orders and hands eligible ones to the
//!   [`pipeline`], which folds them into the per-product matrices.
//! - [`cache`] rebuilds one customer-product cache entry from its history.
//! - [`recalculation`] rebuilds every cache entry of a tenant, on demand or
//!   from the daily [`scheduler`], and can be stopped through [`cancel`].
//! - [`queries`] serves the read paths over both stores.
//! - [`services`] wires all of the above over one set of stores.

pub mod cache;
pub mod cancel;
pub mod error;
pub mod pipeline;
pub mod queries;
pub mod recalculation;
pub mod recorder;
pub mod scheduler;
pub mod services;

pub use cache::{CacheUpdate, CacheUpdater};
pub use cancel::CancellationToken;
pub use error::AffinityError;
pub use pipeline::{IncrementalUpdatePipeline, PipelineReport, ProductFailure, ProductUpdate};
pub use queries::{
    AffinityListFilter, AffinityQueries, AtRiskCustomer, CoPurchaseFilter, CustomerProduct,
    CustomerProducts, ProductCustomers, PurchaseFilter, Recommendation,
};
pub use recalculation::{
    FatalJobFailure, PairFailure, RecalculationJob, RecalculationReport, TenantFailure,
    TenantReport,
};
pub use recorder::{RecordReceipt, TransactionRecorder};
pub use scheduler::{run_daily, DailySchedule};
pub use services::{AffinityServices, Stores};
