use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::BoxFuture;
use crate::diff::RecordDiff;

#[derive(Debug, Error)]
pub enum DiffQueueError {
    #[error("diff queue unavailable: {0}")]
    Unavailable(String),
    #[error("diff queue serialization error: {0}")]
    Serialization(String),
    #[error("diff queue operation failed: {0}")]
    Operation(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiffEnvelope {
    pub delivery_id: String,
    pub diff: RecordDiff,
    pub attempt: u32,
    pub published_at_ms: i64,
}

impl DiffEnvelope {
    pub fn new(delivery_id: String, diff: RecordDiff, published_at_ms: i64) -> Self {
        Self {
            delivery_id,
            diff,
            attempt: 1,
            published_at_ms,
        }
    }

    pub fn next_attempt(&self) -> u32 {
        self.attempt.saturating_add(1)
    }
}

/// Transport for the mutation stream. Deliveries stay in flight until acked.
pub trait DiffQueue: Send + Sync {
    fn enqueue(&self, envelope: &DiffEnvelope) -> BoxFuture<'_, Result<(), DiffQueueError>>;
    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<DiffEnvelope>, DiffQueueError>>;
    fn ack(&self, delivery_id: &str) -> BoxFuture<'_, Result<(), DiffQueueError>>;
    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, DiffQueueError>>;
    fn depth(&self) -> BoxFuture<'_, Result<usize, DiffQueueError>>;
}
