use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::ports::BoxFuture;
use crate::ports::stream::{DiffEnvelope, DiffQueue, DiffQueueError};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    processing: Vec<String>,
    payloads: HashMap<String, DiffEnvelope>,
}

/// Process-local mutation stream transport with the same ready/processing
/// lifecycle as the Redis queue.
#[derive(Clone, Default)]
pub struct InMemoryDiffQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryDiffQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, DiffQueueError> {
        self.state
            .lock()
            .map_err(|_| DiffQueueError::Unavailable("diff queue lock poisoned".into()))
    }

    fn try_pop(&self) -> Result<Option<DiffEnvelope>, DiffQueueError> {
        let mut state = self.lock()?;
        while let Some(delivery_id) = state.ready.pop_front() {
            if let Some(envelope) = state.payloads.get(&delivery_id).cloned() {
                state.processing.push(delivery_id);
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }
}

impl DiffQueue for InMemoryDiffQueue {
    fn enqueue(&self, envelope: &DiffEnvelope) -> BoxFuture<'_, Result<(), DiffQueueError>> {
        let envelope = envelope.clone();
        Box::pin(async move {
            {
                let mut state = self.lock()?;
                let delivery_id = envelope.delivery_id.clone();
                state.processing.retain(|id| id != &delivery_id);
                state.payloads.insert(delivery_id.clone(), envelope);
                state.ready.push_back(delivery_id);
            }
            self.notify.notify_one();
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<DiffEnvelope>, DiffQueueError>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(envelope) = self.try_pop()? {
                    return Ok(Some(envelope));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                if tokio::time::timeout(remaining, self.notify.notified())
                    .await
                    .is_err()
                {
                    return Ok(None);
                }
            }
        })
    }

    fn ack(&self, delivery_id: &str) -> BoxFuture<'_, Result<(), DiffQueueError>> {
        let delivery_id = delivery_id.to_string();
        Box::pin(async move {
            let mut state = self.lock()?;
            state.processing.retain(|id| id != &delivery_id);
            state.payloads.remove(&delivery_id);
            Ok(())
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, DiffQueueError>> {
        Box::pin(async move {
            let moved = {
                let mut state = self.lock()?;
                let count = limit.min(state.processing.len());
                let moved: Vec<String> = state.processing.drain(..count).collect();
                // Requeued deliveries go ahead of anything published since.
                for delivery_id in moved.iter().rev() {
                    state.ready.push_front(delivery_id.clone());
                }
                moved.len()
            };
            if moved > 0 {
                self.notify.notify_one();
            }
            Ok(moved)
        })
    }

    fn depth(&self) -> BoxFuture<'_, Result<usize, DiffQueueError>> {
        Box::pin(async move { Ok(self.lock()?.ready.len()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::RecordDiff;
    use crate::record::{EntityKind, ItemKey, Record};

    fn envelope(id: &str) -> DiffEnvelope {
        let key = ItemKey::root(EntityKind::Post, id);
        DiffEnvelope::new(
            id.to_string(),
            RecordDiff::new(key.clone(), None, Some(Record::new(&key))),
            0,
        )
    }

    #[tokio::test]
    async fn unacked_deliveries_are_requeued_in_order() {
        let queue = InMemoryDiffQueue::new();
        queue.enqueue(&envelope("d-1")).await.unwrap();
        queue.enqueue(&envelope("d-2")).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.delivery_id, "d-1");
        assert_eq!(queue.depth().await.unwrap(), 1);

        assert_eq!(queue.requeue_processing(10).await.unwrap(), 1);
        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.delivery_id, "d-1");
        queue.ack("d-1").await.unwrap();

        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.delivery_id, "d-2");
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue = InMemoryDiffQueue::new();
        let result = queue.dequeue(Duration::from_millis(5)).await.unwrap();
        assert!(result.is_none());
    }
}
