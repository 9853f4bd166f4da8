use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use affinity_core::domain::transaction::{Transaction, TransactionId};
use affinity_db::repositories::{RecordOutcome, TenantDirectory, TransactionStore};

use crate::error::AffinityError;
use crate::pipeline::{IncrementalUpdatePipeline, PipelineReport};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordReceipt {
    pub transaction_id: TransactionId,
    /// The order had already been recorded; nothing was written.
    pub duplicate: bool,
    /// Present only when the affinity pipeline ran and returned a report.
    pub affinity: Option<PipelineReport>,
}

/// Entry point for completed orders. Recording is the durable part; the
/// affinity update that follows is best-effort and its failure is logged,
/// never returned.
pub struct TransactionRecorder {
    tenants: Arc<dyn TenantDirectory>,
    transactions: Arc<dyn TransactionStore>,
    pipeline: Arc<IncrementalUpdatePipeline>,
}

impl TransactionRecorder {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        transactions: Arc<dyn TransactionStore>,
        pipeline: Arc<IncrementalUpdatePipeline>,
    ) -> Self {
        Self { tenants, transactions, pipeline }
    }

    pub async fn record(
        &self,
        transaction: Transaction,
        now: DateTime<Utc>,
    ) -> Result<RecordReceipt, AffinityError> {
        transaction.validate()?;
        if self.tenants.find_by_id(&transaction.tenant_id).await?.is_none() {
            return Err(AffinityError::NotFound {
                entity: "tenant",
                id: transaction.tenant_id.0.clone(),
            });
        }

        match self.transactions.record(transaction.clone()).await? {
            RecordOutcome::Duplicate { existing } => {
                tracing::info!(
                    event_name = "affinity.recorder.duplicate",
                    tenant_id = %transaction.tenant_id,
                    order_id = %transaction.order_id,
                    transaction_id = %existing,
                    "order already recorded"
                );
                Ok(RecordReceipt { transaction_id: existing, duplicate: true, affinity: None })
            }
            RecordOutcome::Recorded => {
                tracing::info!(
                    event_name = "affinity.recorder.recorded",
                    tenant_id = %transaction.tenant_id,
                    customer_id = %transaction.customer_id,
                    transaction_id = %transaction.id,
                    eligible = transaction.is_eligible(),
                    "transaction recorded"
                );

                let affinity = if transaction.is_eligible() {
                    self.run_pipeline(&transaction, now).await
                } else {
                    None
                };

                Ok(RecordReceipt { transaction_id: transaction.id, duplicate: false, affinity })
            }
        }
    }

    async fn run_pipeline(
        &self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Option<PipelineReport> {
        match self.pipeline.apply(transaction, now).await {
            Ok(report) => {
                if report.is_partial() {
                    tracing::warn!(
                        event_name = "affinity.recorder.pipeline_partial",
                        tenant_id = %transaction.tenant_id,
                        transaction_id = %transaction.id,
                        failed_products = report.failures.len(),
                        "affinity index partially updated"
                    );
                }
                Some(report)
            }
            Err(error) => {
                tracing::error!(
                    event_name = "affinity.recorder.pipeline_failed",
                    tenant_id = %transaction.tenant_id,
                    transaction_id = %transaction.id,
                    error = %error,
                    "affinity update failed; transaction stays recorded"
                );
                None
            }
        }
    }
}
