use std::sync::Arc;

use affinity_core::config::AppConfig;
use affinity_core::errors::DomainError;
use affinity_core::scoring::AffinityScorer;
use affinity_db::repositories::{
    AffinityCacheRepository, MatrixRepository, SqlAffinityCacheRepository, SqlMatrixRepository,
    SqlTenantDirectory, SqlTransactionStore, TenantDirectory, TransactionStore,
};
use affinity_db::DbPool;

use crate::cache::CacheUpdater;
use crate::pipeline::IncrementalUpdatePipeline;
use crate::queries::AffinityQueries;
use crate::recalculation::RecalculationJob;
use crate::recorder::TransactionRecorder;

/// The four stores every service reads from or writes to.
#[derive(Clone)]
pub struct Stores {
    pub tenants: Arc<dyn TenantDirectory>,
    pub transactions: Arc<dyn TransactionStore>,
    pub matrices: Arc<dyn MatrixRepository>,
    pub cache: Arc<dyn AffinityCacheRepository>,
}

impl Stores {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            tenants: Arc::new(SqlTenantDirectory::new(pool.clone())),
            transactions: Arc::new(SqlTransactionStore::new(pool.clone())),
            matrices: Arc::new(SqlMatrixRepository::new(pool.clone())),
            cache: Arc::new(SqlAffinityCacheRepository::new(pool)),
        }
    }
}

/// Fully wired engine for one set of stores.
#[derive(Clone)]
pub struct AffinityServices {
    pub stores: Stores,
    pub pipeline: Arc<IncrementalUpdatePipeline>,
    pub recorder: Arc<TransactionRecorder>,
    pub recalculation: Arc<RecalculationJob>,
    pub queries: Arc<AffinityQueries>,
}

impl AffinityServices {
    pub fn new(stores: Stores, config: &AppConfig) -> Result<Self, DomainError> {
        let scorer = AffinityScorer::new(config.scoring.clone())?;
        let updater =
            CacheUpdater::new(stores.transactions.clone(), stores.cache.clone(), scorer);

        let mut pipeline = IncrementalUpdatePipeline::new(
            stores.transactions.clone(),
            stores.matrices.clone(),
            &config.pipeline,
        );
        if config.pipeline.refresh_cache {
            pipeline = pipeline.with_cache_refresh(updater.clone());
        }
        let pipeline = Arc::new(pipeline);

        let recorder = Arc::new(TransactionRecorder::new(
            stores.tenants.clone(),
            stores.transactions.clone(),
            pipeline.clone(),
        ));
        let recalculation = Arc::new(RecalculationJob::new(
            stores.tenants.clone(),
            stores.transactions.clone(),
            updater,
            &config.recalculation,
        ));
        let queries =
            Arc::new(AffinityQueries::new(stores.matrices.clone(), stores.cache.clone()));

        Ok(Self { stores, pipeline, recorder, recalculation, queries })
    }

    pub fn sqlite(pool: DbPool, config: &AppConfig) -> Result<Self, DomainError> {
        Self::new(Stores::sqlite(pool), config)
    }
}
