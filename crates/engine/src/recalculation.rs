//! Batch Recalculation Job
//!
//! Rebuilds every cache entry of a tenant from its eligible transaction
//! history. Tenants run one after another; the pairs of one tenant run on a
//! bounded set of workers. Failures are folded into the report at the
//! smallest granularity that contains them, so only the initial tenant
//! listing can abort a scheduled run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use affinity_core::config::RecalculationConfig;
use affinity_core::domain::affinity::AffinityKey;
use affinity_core::domain::customer::CustomerId;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::{TenantId, TenantStatus};
use affinity_db::repositories::{RepositoryError, TenantDirectory, TransactionStore};

use crate::cache::{CacheUpdate, CacheUpdater};
use crate::cancel::CancellationToken;
use crate::error::AffinityError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PairFailure {
    pub customer_id: Option<CustomerId>,
    pub product_id: Option<ProductId>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantFailure {
    pub tenant_id: TenantId,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantReport {
    pub tenant_id: TenantId,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub failures: Vec<PairFailure>,
    /// The run stopped launching pairs before reaching the end of the list.
    pub cancelled: bool,
}

impl TenantReport {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            processed: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            failures: Vec::new(),
            cancelled: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecalculationReport {
    pub tenants: Vec<TenantReport>,
    pub tenant_errors: Vec<TenantFailure>,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: bool,
}

impl RecalculationReport {
    fn absorb(&mut self, tenant: TenantReport) {
        self.processed += tenant.processed;
        self.updated += tenant.updated;
        self.skipped += tenant.skipped;
        self.errors += tenant.errors;
        self.cancelled |= tenant.cancelled;
        self.tenants.push(tenant);
    }
}

/// The tenant listing failed. Carries whatever was counted before the abort.
#[derive(Debug, Error)]
#[error("recalculation aborted: {source}")]
pub struct FatalJobFailure {
    pub report: RecalculationReport,
    pub source: RepositoryError,
}

#[derive(Clone, Debug)]
struct JobSettings {
    concurrency: usize,
    progress_every: u64,
    tenant_statuses: Vec<TenantStatus>,
}

type PairOutcome = (AffinityKey, Result<CacheUpdate, AffinityError>);

pub struct RecalculationJob {
    tenants: Arc<dyn TenantDirectory>,
    transactions: Arc<dyn TransactionStore>,
    updater: CacheUpdater,
    settings: JobSettings,
}

impl RecalculationJob {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        transactions: Arc<dyn TransactionStore>,
        updater: CacheUpdater,
        config: &RecalculationConfig,
    ) -> Self {
        Self {
            tenants,
            transactions,
            updater,
            settings: JobSettings {
                concurrency: config.concurrency.max(1),
                progress_every: config.progress_every,
                tenant_statuses: config.tenant_statuses.clone(),
            },
        }
    }

    /// Recalculates every tenant whose status is eligible for the scheduled
    /// run. Tenant failures are reported, not returned.
    pub async fn run_scheduled(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RecalculationReport, FatalJobFailure> {
        let mut report = RecalculationReport::default();

        let tenants = match self.tenants.list_by_status(&self.settings.tenant_statuses).await {
            Ok(tenants) => tenants,
            Err(source) => {
                tracing::error!(
                    event_name = "affinity.recalculation.fatal",
                    error = %source,
                    "could not list tenants; aborting run"
                );
                return Err(FatalJobFailure { report, source });
            }
        };

        tracing::info!(
            event_name = "affinity.recalculation.started",
            tenant_count = tenants.len(),
            concurrency = self.settings.concurrency,
            "scheduled recalculation started"
        );

        for tenant in tenants {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.recalculate_tenant(&tenant.id, now, cancel).await {
                Ok(tenant_report) => report.absorb(tenant_report),
                Err(error) => {
                    tracing::error!(
                        event_name = "affinity.recalculation.tenant_failed",
                        tenant_id = %tenant.id,
                        error = %error,
                        "tenant recalculation failed; moving on"
                    );
                    report
                        .tenant_errors
                        .push(TenantFailure { tenant_id: tenant.id, message: error.to_string() });
                }
            }
        }

        tracing::info!(
            event_name = "affinity.recalculation.finished",
            processed = report.processed,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            tenant_errors = report.tenant_errors.len(),
            cancelled = report.cancelled,
            "scheduled recalculation finished"
        );

        Ok(report)
    }

    /// Manual run for one tenant, regardless of its status.
    pub async fn run_for_tenant(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TenantReport, AffinityError> {
        if self.tenants.find_by_id(tenant_id).await?.is_none() {
            return Err(AffinityError::NotFound { entity: "tenant", id: tenant_id.0.clone() });
        }
        Ok(self.recalculate_tenant(tenant_id, now, cancel).await?)
    }

    async fn recalculate_tenant(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TenantReport, RepositoryError> {
        let pairs = self.transactions.eligible_pairs(tenant_id).await?;
        tracing::info!(
            event_name = "affinity.recalculation.tenant_started",
            tenant_id = %tenant_id,
            pair_count = pairs.len(),
            "tenant recalculation started"
        );

        let mut report = TenantReport::new(tenant_id.clone());
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut workers: JoinSet<PairOutcome> = JoinSet::new();

        for (customer_id, product_id) in pairs {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            while let Some(joined) = workers.try_join_next() {
                self.fold(&mut report, joined);
            }

            let key = AffinityKey::new(tenant_id.clone(), customer_id, product_id);
            let updater = self.updater.clone();
            workers.spawn(async move {
                let outcome = updater.refresh(&key, now).await;
                drop(permit);
                (key, outcome)
            });
        }

        // In-flight pairs always finish, cancelled or not.
        while let Some(joined) = workers.join_next().await {
            self.fold(&mut report, joined);
        }

        tracing::info!(
            event_name = "affinity.recalculation.tenant_finished",
            tenant_id = %tenant_id,
            processed = report.processed,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            cancelled = report.cancelled,
            "tenant recalculation finished"
        );

        Ok(report)
    }

    fn fold(&self, report: &mut TenantReport, joined: Result<PairOutcome, JoinError>) {
        report.processed += 1;

        match joined {
            Ok((_, Ok(CacheUpdate::Updated(_)))) => report.updated += 1,
            Ok((_, Ok(CacheUpdate::Skipped))) => report.skipped += 1,
            Ok((key, Err(error))) => {
                tracing::warn!(
                    event_name = "affinity.recalculation.pair_failed",
                    tenant_id = %key.tenant_id,
                    customer_id = %key.customer_id,
                    product_id = %key.product_id,
                    error = %error,
                    "pair recalculation failed"
                );
                report.errors += 1;
                report.failures.push(PairFailure {
                    customer_id: Some(key.customer_id),
                    product_id: Some(key.product_id),
                    message: error.to_string(),
                });
            }
            Err(join_error) => {
                tracing::error!(
                    event_name = "affinity.recalculation.worker_panicked",
                    tenant_id = %report.tenant_id,
                    error = %join_error,
                    "pair worker did not complete"
                );
                report.errors += 1;
                report.failures.push(PairFailure {
                    customer_id: None,
                    product_id: None,
                    message: join_error.to_string(),
                });
            }
        }

        let every = self.settings.progress_every;
        if every > 0 && (report.processed as u64) % every == 0 {
            tracing::info!(
                event_name = "affinity.recalculation.progress",
                tenant_id = %report.tenant_id,
                processed = report.processed,
                updated = report.updated,
                errors = report.errors,
                "recalculation progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use affinity_core::config::RecalculationConfig;
    use affinity_core::domain::affinity::{AffinityKey, CacheQuery, CustomerProductAffinity};
    use affinity_core::domain::customer::CustomerId;
    use affinity_core::domain::product::ProductId;
    use affinity_core::domain::tenant::{Tenant, TenantId, TenantStatus};
    use affinity_core::domain::transaction::{
        LineItem, OrderId, Transaction, TransactionId, TransactionStatus,
    };
    use affinity_core::scoring::AffinityScorer;
    use affinity_db::repositories::{
        AffinityCacheRepository, InMemoryAffinityCacheRepository, InMemoryTenantDirectory,
        InMemoryTransactionStore, RecordOutcome, RepositoryError, TenantDirectory,
        TransactionStore,
    };

    use super::RecalculationJob;
    use crate::cache::CacheUpdater;
    use crate::cancel::CancellationToken;
    use crate::error::AffinityError;

    fn at(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).single().expect("valid date")
            + Duration::days(offset)
    }

    fn config(concurrency: usize) -> RecalculationConfig {
        RecalculationConfig { concurrency, progress_every: 2, ..RecalculationConfig::default() }
    }

    fn sale(tenant: &str, id: &str, customer: &str, product: &str, offset: i64) -> Transaction {
        Transaction {
            id: TransactionId(id.to_string()),
            tenant_id: TenantId(tenant.to_string()),
            customer_id: CustomerId(customer.to_string()),
            order_id: OrderId(format!("order-{id}")),
            order_number: id.to_uppercase(),
            order_date: at(offset),
            status: TransactionStatus::Completed,
            is_paid: true,
            items: vec![LineItem {
                product_id: ProductId(product.to_string()),
                product_name: product.to_string(),
                category: None,
                quantity: 1,
                unit_price: Decimal::ONE,
                total_price: Decimal::ONE,
            }],
            created_at: at(offset),
        }
    }

    async fn tenant(directory: &InMemoryTenantDirectory, id: &str, status: TenantStatus) {
        directory
            .save(Tenant {
                id: TenantId(id.to_string()),
                name: id.to_string(),
                status,
                created_at: at(-100),
            })
            .await
            .expect("save tenant");
    }

    struct BrokenDirectory;

    #[async_trait::async_trait]
    impl TenantDirectory for BrokenDirectory {
        async fn find_by_id(&self, _id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
            Err(RepositoryError::Decode("directory offline".to_string()))
        }

        async fn list_by_status(
            &self,
            _statuses: &[TenantStatus],
        ) -> Result<Vec<Tenant>, RepositoryError> {
            Err(RepositoryError::Decode("directory offline".to_string()))
        }

        async fn save(&self, _tenant: Tenant) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    /// Delegates to an in-memory store but cannot list the pairs of one tenant.
    struct PairsUnavailableFor {
        inner: InMemoryTransactionStore,
        tenant_id: TenantId,
    }

    #[async_trait::async_trait]
    impl TransactionStore for PairsUnavailableFor {
        async fn record(&self, transaction: Transaction) -> Result<RecordOutcome, RepositoryError> {
            self.inner.record(transaction).await
        }

        async fn find_by_id(
            &self,
            tenant_id: &TenantId,
            id: &TransactionId,
        ) -> Result<Option<Transaction>, RepositoryError> {
            self.inner.find_by_id(tenant_id, id).await
        }

        async fn find_by_order(
            &self,
            tenant_id: &TenantId,
            order_id: &OrderId,
        ) -> Result<Option<Transaction>, RepositoryError> {
            self.inner.find_by_order(tenant_id, order_id).await
        }

        async fn eligible_purchases(
            &self,
            key: &AffinityKey,
        ) -> Result<Vec<Transaction>, RepositoryError> {
            self.inner.eligible_purchases(key).await
        }

        async fn eligible_pairs(
            &self,
            tenant_id: &TenantId,
        ) -> Result<Vec<(CustomerId, ProductId)>, RepositoryError> {
            if tenant_id == &self.tenant_id {
                return Err(RepositoryError::Decode("pair index unavailable".to_string()));
            }
            self.inner.eligible_pairs(tenant_id).await
        }
    }

    /// In-memory cache that refuses writes for one product and can cancel a
    /// run from inside its first write.
    #[derive(Default)]
    struct GuardedCache {
        inner: InMemoryAffinityCacheRepository,
        rejected_product: Option<ProductId>,
        cancel_on_write: Option<CancellationToken>,
    }

    #[async_trait::async_trait]
    impl AffinityCacheRepository for GuardedCache {
        async fn find(
            &self,
            key: &AffinityKey,
        ) -> Result<Option<CustomerProductAffinity>, RepositoryError> {
            self.inner.find(key).await
        }

        async fn upsert(&self, affinity: &CustomerProductAffinity) -> Result<(), RepositoryError> {
            if let Some(token) = &self.cancel_on_write {
                token.cancel();
            }
            if self.rejected_product.as_ref() == Some(&affinity.key.product_id) {
                return Err(RepositoryError::Decode("cache write rejected".to_string()));
            }
            self.inner.upsert(affinity).await
        }

        async fn list_for_customer(
            &self,
            tenant_id: &TenantId,
            customer_id: &CustomerId,
            query: &CacheQuery,
        ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
            self.inner.list_for_customer(tenant_id, customer_id, query).await
        }

        async fn list_for_product(
            &self,
            tenant_id: &TenantId,
            product_id: &ProductId,
            query: &CacheQuery,
        ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
            self.inner.list_for_product(tenant_id, product_id, query).await
        }

        async fn list_for_tenant(
            &self,
            tenant_id: &TenantId,
            query: &CacheQuery,
        ) -> Result<Vec<CustomerProductAffinity>, RepositoryError> {
            self.inner.list_for_tenant(tenant_id, query).await
        }
    }

    fn job_with(
        tenants: Arc<dyn TenantDirectory>,
        transactions: Arc<dyn TransactionStore>,
        cache: Arc<dyn AffinityCacheRepository>,
        concurrency: usize,
    ) -> RecalculationJob {
        let updater = CacheUpdater::new(transactions.clone(), cache, AffinityScorer::default());
        RecalculationJob::new(tenants, transactions, updater, &config(concurrency))
    }

    fn job(
        tenants: Arc<dyn TenantDirectory>,
        transactions: Arc<InMemoryTransactionStore>,
        concurrency: usize,
    ) -> RecalculationJob {
        job_with(
            tenants,
            transactions,
            Arc::new(InMemoryAffinityCacheRepository::default()),
            concurrency,
        )
    }

    fn pair_key(tenant_id: &str, customer: &str, product: &str) -> AffinityKey {
        AffinityKey::new(
            TenantId(tenant_id.to_string()),
            CustomerId(customer.to_string()),
            ProductId(product.to_string()),
        )
    }

    #[tokio::test]
    async fn zero_tenants_yield_zero_counters() {
        let job = job(
            Arc::new(InMemoryTenantDirectory::default()),
            Arc::new(InMemoryTransactionStore::default()),
            4,
        );

        let report = job.run_scheduled(at(0), &CancellationToken::new()).await.expect("run");

        assert_eq!(report.processed, 0);
        assert_eq!(report.updated, 0);
        assert_eq!(report.errors, 0);
        assert!(report.tenants.is_empty());
        assert!(report.tenant_errors.is_empty());
    }

    #[tokio::test]
    async fn scheduled_run_only_covers_active_and_trial_tenants() {
        let tenants = Arc::new(InMemoryTenantDirectory::default());
        tenant(&tenants, "t-active", TenantStatus::Active).await;
        tenant(&tenants, "t-trial", TenantStatus::Trial).await;
        tenant(&tenants, "t-suspended", TenantStatus::Suspended).await;
        let transactions = Arc::new(InMemoryTransactionStore::default());
        for (tenant_id, id) in [("t-active", "a-1"), ("t-trial", "b-1"), ("t-suspended", "c-1")] {
            transactions.record(sale(tenant_id, id, "c-1", "p-1", 0)).await.expect("record");
        }
        transactions.record(sale("t-active", "a-2", "c-2", "p-1", 1)).await.expect("record");

        let report = job(tenants, transactions, 2)
            .run_scheduled(at(5), &CancellationToken::new())
            .await
            .expect("run");

        let covered: Vec<&str> = report.tenants.iter().map(|entry| entry.tenant_id.0.as_str()).collect();
        assert_eq!(covered, vec!["t-active", "t-trial"]);
        assert_eq!(report.processed, 3);
        assert_eq!(report.updated, 3);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn manual_run_ignores_status_but_requires_the_tenant() {
        let tenants = Arc::new(InMemoryTenantDirectory::default());
        tenant(&tenants, "t-suspended", TenantStatus::Suspended).await;
        let transactions = Arc::new(InMemoryTransactionStore::default());
        transactions.record(sale("t-suspended", "s-1", "c-1", "p-1", 0)).await.expect("record");
        let job = job(tenants, transactions, 1);

        let report = job
            .run_for_tenant(&TenantId("t-suspended".to_string()), at(1), &CancellationToken::new())
            .await
            .expect("manual run");
        assert_eq!((report.processed, report.updated), (1, 1));

        let error = job
            .run_for_tenant(&TenantId("t-missing".to_string()), at(1), &CancellationToken::new())
            .await
            .expect_err("unknown tenant");
        assert!(matches!(error, AffinityError::NotFound { entity: "tenant", .. }));
    }

    #[tokio::test]
    async fn tenant_listing_failure_is_fatal_with_counters() {
        let job = job(Arc::new(BrokenDirectory), Arc::new(InMemoryTransactionStore::default()), 1);

        let failure =
            job.run_scheduled(at(0), &CancellationToken::new()).await.expect_err("fatal failure");

        assert_eq!(failure.report.processed, 0);
        assert!(failure.to_string().contains("directory offline"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_launching_pairs() {
        let tenants = Arc::new(InMemoryTenantDirectory::default());
        tenant(&tenants, "t-1", TenantStatus::Active).await;
        let transactions = Arc::new(InMemoryTransactionStore::default());
        transactions.record(sale("t-1", "x-1", "c-1", "p-1", 0)).await.expect("record");
        let job = job(tenants, transactions, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = job
            .run_for_tenant(&TenantId("t-1".to_string()), at(1), &cancel)
            .await
            .expect("cancelled run still reports");

        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn failing_pair_is_counted_while_other_pairs_finish() {
        let tenants = Arc::new(InMemoryTenantDirectory::default());
        tenant(&tenants, "t-1", TenantStatus::Active).await;
        let transactions = Arc::new(InMemoryTransactionStore::default());
        let sales = [("x-1", "c-1", "p-1"), ("x-2", "c-1", "p-2"), ("x-3", "c-2", "p-1")];
        for (id, customer, product) in sales {
            transactions.record(sale("t-1", id, customer, product, 0)).await.expect("record");
        }
        let cache = Arc::new(GuardedCache {
            rejected_product: Some(ProductId("p-2".to_string())),
            ..GuardedCache::default()
        });
        let job = job_with(tenants, transactions, cache.clone(), 2);

        let report = job
            .run_for_tenant(&TenantId("t-1".to_string()), at(3), &CancellationToken::new())
            .await
            .expect("pair failures do not fail the tenant");

        assert_eq!(report.processed, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].customer_id, Some(CustomerId("c-1".to_string())));
        assert_eq!(report.failures[0].product_id, Some(ProductId("p-2".to_string())));
        assert!(report.failures[0].message.contains("cache write rejected"));

        assert!(cache.find(&pair_key("t-1", "c-1", "p-1")).await.expect("find").is_some());
        assert!(cache.find(&pair_key("t-1", "c-2", "p-1")).await.expect("find").is_some());
        assert!(cache.find(&pair_key("t-1", "c-1", "p-2")).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn tenant_enumeration_failure_moves_on_to_later_tenants() {
        let tenants = Arc::new(InMemoryTenantDirectory::default());
        for id in ["t-a", "t-b", "t-c"] {
            tenant(&tenants, id, TenantStatus::Active).await;
        }
        let transactions = Arc::new(PairsUnavailableFor {
            inner: InMemoryTransactionStore::default(),
            tenant_id: TenantId("t-b".to_string()),
        });
        for (tenant_id, id) in [("t-a", "a-1"), ("t-b", "b-1"), ("t-c", "c-1")] {
            transactions.record(sale(tenant_id, id, "c-1", "p-1", 0)).await.expect("record");
        }
        let job = job_with(
            tenants,
            transactions,
            Arc::new(InMemoryAffinityCacheRepository::default()),
            2,
        );

        let report = job.run_scheduled(at(2), &CancellationToken::new()).await.expect("run");

        let covered: Vec<&str> = report.tenants.iter().map(|entry| entry.tenant_id.0.as_str()).collect();
        assert_eq!(covered, vec!["t-a", "t-c"]);
        assert_eq!(report.tenant_errors.len(), 1);
        assert_eq!(report.tenant_errors[0].tenant_id, TenantId("t-b".to_string()));
        assert!(report.tenant_errors[0].message.contains("pair index unavailable"));
        assert_eq!(report.processed, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn cancelling_mid_run_drains_in_flight_pairs_and_reports() {
        let tenants = Arc::new(InMemoryTenantDirectory::default());
        tenant(&tenants, "t-1", TenantStatus::Active).await;
        let transactions = Arc::new(InMemoryTransactionStore::default());
        for (id, customer) in [("x-1", "c-1"), ("x-2", "c-2"), ("x-3", "c-3")] {
            transactions.record(sale("t-1", id, customer, "p-1", 0)).await.expect("record");
        }
        let cancel = CancellationToken::new();
        let cache = Arc::new(GuardedCache {
            cancel_on_write: Some(cancel.clone()),
            ..GuardedCache::default()
        });
        let job = job_with(tenants, transactions, cache.clone(), 1);

        let report = job
            .run_for_tenant(&TenantId("t-1".to_string()), at(1), &cancel)
            .await
            .expect("cancelled run still reports");

        assert!(report.cancelled);
        assert_eq!(report.processed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors, 0);
        assert!(cache.find(&pair_key("t-1", "c-1", "p-1")).await.expect("find").is_some());
        assert!(cache.find(&pair_key("t-1", "c-2", "p-1")).await.expect("find").is_none());
    }
}
