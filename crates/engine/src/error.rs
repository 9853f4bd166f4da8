use thiserror::Error;

use affinity_core::errors::{ApplicationError, DomainError};
use affinity_db::repositories::RepositoryError;

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("transaction `{transaction_id}` is unpaid or reversed")]
    NotEligible { transaction_id: String },
    #[error("matrix for product `{product_id}` still conflicted after {attempts} write attempts")]
    WriteConflict { product_id: String, attempts: u32 },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<AffinityError> for ApplicationError {
    fn from(error: AffinityError) -> Self {
        match error {
            AffinityError::NotFound { entity, id } => Self::NotFound { entity, id },
            AffinityError::NotEligible { transaction_id } => {
                Self::Domain(DomainError::InvalidTransaction(format!(
                    "transaction {transaction_id} is not paid or has been reversed"
                )))
            }
            AffinityError::Domain(error) => Self::Domain(error),
            conflict @ AffinityError::WriteConflict { .. } => Self::Persistence(conflict.to_string()),
            AffinityError::Repository(error) => Self::Persistence(error.to_string()),
        }
    }
}
