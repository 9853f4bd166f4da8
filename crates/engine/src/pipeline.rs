//! Incremental Update Pipeline
//!
//! Folds one recorded transaction into the product affinity matrix of every
//! product it contains. Each product is an independent read-modify-write
//! guarded by the matrix version; a failure on one product never undoes the
//! products already written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use affinity_core::config::PipelineConfig;
use affinity_core::domain::affinity::AffinityKey;
use affinity_core::domain::matrix::ProductAffinityMatrix;
use affinity_core::domain::product::ProductId;
use affinity_core::domain::tenant::TenantId;
use affinity_core::domain::transaction::{ProductContribution, Transaction, TransactionId};
use affinity_db::repositories::{MatrixRepository, SaveOutcome, TransactionStore};

use crate::cache::CacheUpdater;
use crate::error::AffinityError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProductUpdate {
    pub product_id: ProductId,
    pub version: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProductFailure {
    pub product_id: ProductId,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub transaction_id: TransactionId,
    pub products_updated: Vec<ProductUpdate>,
    pub failures: Vec<ProductFailure>,
    pub cache_refreshed: usize,
    pub cache_failures: Vec<ProductFailure>,
}

impl PipelineReport {
    fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            products_updated: Vec::new(),
            failures: Vec::new(),
            cache_refreshed: 0,
            cache_failures: Vec::new(),
        }
    }

    /// Some matrix writes failed while others went through.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct IncrementalUpdatePipeline {
    transactions: Arc<dyn TransactionStore>,
    matrices: Arc<dyn MatrixRepository>,
    cache_updater: Option<CacheUpdater>,
    max_write_retries: u32,
}

impl IncrementalUpdatePipeline {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        matrices: Arc<dyn MatrixRepository>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            transactions,
            matrices,
            cache_updater: None,
            max_write_retries: config.max_write_retries.max(1),
        }
    }

    /// Also refresh the affected cache pairs after the matrix writes. The
    /// refresh is best-effort and never turns a successful run into an error.
    pub fn with_cache_refresh(mut self, updater: CacheUpdater) -> Self {
        self.cache_updater = Some(updater);
        self
    }

    /// Loads a recorded transaction and applies it.
    pub async fn apply_by_id(
        &self,
        tenant_id: &TenantId,
        transaction_id: &TransactionId,
        now: DateTime<Utc>,
    ) -> Result<PipelineReport, AffinityError> {
        let transaction = self
            .transactions
            .find_by_id(tenant_id, transaction_id)
            .await?
            .ok_or_else(|| AffinityError::NotFound {
                entity: "transaction",
                id: transaction_id.0.clone(),
            })?;
        self.apply(&transaction, now).await
    }

    pub async fn apply(
        &self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<PipelineReport, AffinityError> {
        if !transaction.is_eligible() {
            return Err(AffinityError::NotEligible { transaction_id: transaction.id.0.clone() });
        }

        let mut report = PipelineReport::new(transaction.id.clone());
        let contributions = transaction.contributions();

        for contribution in &contributions {
            match self.apply_to_product(transaction, contribution, now).await {
                Ok(version) => report
                    .products_updated
                    .push(ProductUpdate { product_id: contribution.product_id.clone(), version }),
                Err(error) => {
                    tracing::warn!(
                        event_name = "affinity.pipeline.product_failed",
                        tenant_id = %transaction.tenant_id,
                        transaction_id = %transaction.id,
                        product_id = %contribution.product_id,
                        error = %error,
                        "matrix update failed for product"
                    );
                    report.failures.push(ProductFailure {
                        product_id: contribution.product_id.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }

        if let Some(updater) = &self.cache_updater {
            for contribution in &contributions {
                let key = AffinityKey::new(
                    transaction.tenant_id.clone(),
                    transaction.customer_id.clone(),
                    contribution.product_id.clone(),
                );
                match updater.refresh(&key, now).await {
                    Ok(_) => report.cache_refreshed += 1,
                    Err(error) => {
                        tracing::warn!(
                            event_name = "affinity.pipeline.cache_refresh_failed",
                            tenant_id = %key.tenant_id,
                            customer_id = %key.customer_id,
                            product_id = %key.product_id,
                            error = %error,
                            "cache refresh failed; the next recalculation will repair it"
                        );
                        report.cache_failures.push(ProductFailure {
                            product_id: key.product_id,
                            message: error.to_string(),
                        });
                    }
                }
            }
        }

        tracing::info!(
            event_name = "affinity.pipeline.applied",
            tenant_id = %transaction.tenant_id,
            transaction_id = %transaction.id,
            products_updated = report.products_updated.len(),
            product_failures = report.failures.len(),
            cache_refreshed = report.cache_refreshed,
            "transaction folded into affinity index"
        );

        Ok(report)
    }

    /// Deletes the matrix of one product together with its reverse index.
    /// This is the only path that removes a matrix.
    pub async fn rollback_product(
        &self,
        tenant_id: &TenantId,
        product_id: &ProductId,
    ) -> Result<bool, AffinityError> {
        let removed = self.matrices.delete(tenant_id, product_id).await?;
        tracing::info!(
            event_name = "affinity.pipeline.rollback",
            tenant_id = %tenant_id,
            product_id = %product_id,
            removed,
            "product matrix rolled back"
        );
        Ok(removed)
    }

    /// Returns the stored version after the write.
    async fn apply_to_product(
        &self,
        transaction: &Transaction,
        contribution: &ProductContribution,
        now: DateTime<Utc>,
    ) -> Result<i64, AffinityError> {
        for attempt in 1..=self.max_write_retries {
            let stored = self.matrices.find(&transaction.tenant_id, &contribution.product_id).await?;
            let expected_version = stored.as_ref().map_or(0, |matrix| matrix.version);
            let mut matrix = stored.unwrap_or_else(|| {
                ProductAffinityMatrix::new(
                    transaction.tenant_id.clone(),
                    contribution.product_id.clone(),
                    contribution.product_name.clone(),
                    now,
                )
            });

            matrix.apply_transaction(transaction, now)?;
            matrix.verify_invariants()?;

            match self.matrices.save(&matrix, expected_version).await? {
                SaveOutcome::Saved { version } => return Ok(version),
                SaveOutcome::VersionConflict => {
                    tracing::debug!(
                        event_name = "affinity.pipeline.version_conflict",
                        tenant_id = %transaction.tenant_id,
                        product_id = %contribution.product_id,
                        attempt,
                        "matrix changed concurrently; retrying"
                    );
                }
            }
        }

        Err(AffinityError::WriteConflict {
            product_id: contribution.product_id.0.clone(),
            attempts: self.max_write_retries,
        })
    }
}
