use thiserror::Error;

use crate::ports::clients::ClientError;
use crate::ports::store::StoreError;
use crate::transaction::MutationError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}
