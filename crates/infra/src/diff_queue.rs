use std::time::Duration;

use redis::AsyncCommands;
use redis::Value;
use redis::aio::ConnectionManager;
use ripple_domain::ports::BoxFuture;
use ripple_domain::ports::stream::{DiffEnvelope, DiffQueue, DiffQueueError};

/// Key layout of one diff queue; the entity store writes into the same keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub processing: String,
    pub payloads: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            ready: format!("{prefix}:ready"),
            processing: format!("{prefix}:processing"),
            payloads: format!("{prefix}:payloads"),
        }
    }
}

/// Redis-backed mutation stream. New deliveries are pushed on the head of the ready list
/// and consumed from its tail, so a single consumer sees them in publish order.
#[derive(Clone)]
pub struct RedisDiffQueue {
    manager: ConnectionManager,
    keys: QueueKeys,
}

impl RedisDiffQueue {
    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, DiffQueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| DiffQueueError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| DiffQueueError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            keys: QueueKeys::new(&prefix.into()),
        })
    }

    fn serialize(envelope: &DiffEnvelope) -> Result<String, DiffQueueError> {
        serde_json::to_string(envelope)
            .map_err(|err| DiffQueueError::Serialization(err.to_string()))
    }

    fn deserialize(payload: &str) -> Result<DiffEnvelope, DiffQueueError> {
        serde_json::from_str(payload).map_err(|err| DiffQueueError::Serialization(err.to_string()))
    }
}

impl DiffQueue for RedisDiffQueue {
    fn enqueue(&self, envelope: &DiffEnvelope) -> BoxFuture<'_, Result<(), DiffQueueError>> {
        let payload = match Self::serialize(envelope) {
            Ok(payload) => payload,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let delivery_id = envelope.delivery_id.clone();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("HSET")
                .arg(&self.keys.payloads)
                .arg(&delivery_id)
                .arg(payload);
            pipeline.cmd("LPUSH").arg(&self.keys.ready).arg(&delivery_id);
            let _: Vec<Value> = pipeline
                .query_async(&mut conn)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<DiffEnvelope>, DiffQueueError>> {
        // Zero blocks forever in BRPOPLPUSH.
        let timeout_secs = timeout.as_secs().max(1);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let result: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&self.keys.ready)
                .arg(&self.keys.processing)
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            let Some(delivery_id) = result else {
                return Ok(None);
            };
            let payload: Option<String> = conn
                .hget(&self.keys.payloads, &delivery_id)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            let Some(payload) = payload else {
                let _: i64 = conn
                    .lrem(&self.keys.processing, 1, &delivery_id)
                    .await
                    .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
                return Err(DiffQueueError::Operation(format!(
                    "missing payload for delivery {delivery_id}"
                )));
            };
            Ok(Some(Self::deserialize(&payload)?))
        })
    }

    fn ack(&self, delivery_id: &str) -> BoxFuture<'_, Result<(), DiffQueueError>> {
        let delivery_id = delivery_id.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("LREM")
                .arg(&self.keys.processing)
                .arg(1)
                .arg(&delivery_id);
            pipeline.cmd("HDEL").arg(&self.keys.payloads).arg(&delivery_id);
            let _: Vec<Value> = pipeline
                .query_async(&mut conn)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            Ok(())
        })
    }

    /// Moves the oldest in-flight deliveries back to the consuming end of the ready list.
    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, DiffQueueError>> {
        Box::pin(async move {
            if limit == 0 {
                return Ok(0);
            }
            let mut conn = self.manager.clone();
            let delivery_ids: Vec<String> = conn
                .lrange(&self.keys.processing, -(limit as isize), -1)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            if delivery_ids.is_empty() {
                return Ok(0);
            }
            let mut pipeline = redis::pipe();
            pipeline.atomic();
            pipeline
                .cmd("RPUSH")
                .arg(&self.keys.ready)
                .arg(delivery_ids.clone());
            pipeline
                .cmd("LTRIM")
                .arg(&self.keys.processing)
                .arg(0)
                .arg(-(delivery_ids.len() as i64) - 1);
            let _: Vec<Value> = pipeline
                .query_async(&mut conn)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            Ok(delivery_ids.len())
        })
    }

    fn depth(&self) -> BoxFuture<'_, Result<usize, DiffQueueError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let ready: usize = conn
                .llen(&self.keys.ready)
                .await
                .map_err(|err| DiffQueueError::Operation(err.to_string()))?;
            Ok(ready)
        })
    }
}
