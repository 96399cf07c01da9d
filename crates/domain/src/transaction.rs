use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::store::{EntityStore, ReadConsistency, StoreError, WriteOp};
use crate::record::{EntityKind, ItemKey, Record};

/// Caller-supplied description of what a failed transaction branch means.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct MutationError {
    pub entity: EntityKind,
    pub message: String,
}

impl MutationError {
    pub fn new(entity: EntityKind, message: impl Into<String>) -> Self {
        Self {
            entity,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct TransactionCoordinator {
    store: Arc<dyn EntityStore>,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Commits `writes` as one atomic group. `errors[i]` is raised when branch `i`
    /// is the one that failed.
    pub async fn transact_write(
        &self,
        writes: &[WriteOp],
        errors: &[MutationError],
    ) -> DomainResult<()> {
        if writes.is_empty() {
            return Err(DomainError::Validation(
                "transaction requires at least one write".into(),
            ));
        }
        if writes.len() != errors.len() {
            return Err(DomainError::Validation(format!(
                "transaction has {} writes but {} error descriptors",
                writes.len(),
                errors.len()
            )));
        }

        match self.store.transact_write(writes).await {
            Ok(()) => Ok(()),
            Err(StoreError::TransactionCanceled {
                failed_branch: Some(branch),
            }) if branch < errors.len() => Err(DomainError::Mutation(errors[branch].clone())),
            Err(err) => {
                warn!(error = %err, branches = writes.len(), "transaction failed without an attributable branch");
                Err(DomainError::TransactionFailed(err.to_string()))
            }
        }
    }

    /// Commits the group, then reads `key` back with a strongly consistent read.
    pub async fn transact_and_read(
        &self,
        writes: &[WriteOp],
        errors: &[MutationError],
        key: &ItemKey,
    ) -> DomainResult<Record> {
        self.transact_write(writes, errors).await?;
        self.store
            .get(key, ReadConsistency::Strong)
            .await?
            .ok_or(DomainError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::store::UpdateItem;
    use crate::store::InMemoryEntityStore;

    fn coordinator() -> (Arc<InMemoryEntityStore>, TransactionCoordinator) {
        let store = Arc::new(InMemoryEntityStore::new());
        (store.clone(), TransactionCoordinator::new(store))
    }

    #[tokio::test]
    async fn raises_descriptor_of_failed_branch() {
        let (store, coordinator) = coordinator();
        let album = Record::new(&ItemKey::root(EntityKind::Album, "a-1"));
        store.put(&album, None).await.unwrap();

        let err = coordinator
            .transact_write(
                &[WriteOp::put_new(album)],
                &[MutationError::new(EntityKind::Album, "id already used")],
            )
            .await
            .unwrap_err();
        match err {
            DomainError::Mutation(err) => assert_eq!(err.message, "id already used"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_mismatched_descriptors() {
        let (_, coordinator) = coordinator();
        let update = UpdateItem::new(ItemKey::root(EntityKind::User, "u-1")).add("albumCount", 1);
        let err = coordinator
            .transact_write(&[WriteOp::Update(update)], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn unattributable_failure_is_generic() {
        let (_, coordinator) = coordinator();
        let key = ItemKey::root(EntityKind::User, "u-1");
        let err = coordinator
            .transact_write(
                &[
                    WriteOp::ConditionCheck {
                        key: key.clone(),
                        condition: crate::ports::store::Condition::NotExists,
                    },
                    WriteOp::delete_existing(key),
                ],
                &[
                    MutationError::new(EntityKind::User, "first"),
                    MutationError::new(EntityKind::User, "second"),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::TransactionFailed(_)));
    }
}
