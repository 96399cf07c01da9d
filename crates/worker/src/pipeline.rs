use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use ripple_domain::dispatch::{DiffRouter, RouteOutcome};
use ripple_domain::gc::GarbageCollector;
use ripple_domain::ports::stream::DiffQueue;
use ripple_domain::util::{backoff_ms, now_ms};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::observability;

#[derive(Clone, Copy, Debug)]
pub struct ConsumerSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed(RouteOutcome),
    Dropped,
}

/// Single consumer, so deliveries for one key are handled in publish order.
pub struct Consumer {
    router: DiffRouter,
    queue: Arc<dyn DiffQueue>,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(router: DiffRouter, queue: Arc<dyn DiffQueue>, settings: ConsumerSettings) -> Self {
        Self {
            router,
            queue,
            settings,
        }
    }

    /// Shutdown is observed between deliveries; one already dequeued is always finished and
    /// acked first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("diff consumer started");
        while !*shutdown.borrow() {
            if let Err(err) = self.run_once().await {
                error!(error = %err, "diff consumer iteration failed");
                sleep(self.settings.poll_interval).await;
            }
        }
        info!("diff consumer stopped");
    }

    /// Handles at most one delivery; `None` when the queue stayed empty for a poll interval.
    pub async fn run_once(&self) -> Result<Option<DeliveryOutcome>> {
        let Some(mut envelope) = self.queue.dequeue(self.settings.poll_interval).await? else {
            if let Ok(depth) = self.queue.depth().await {
                observability::set_queue_depth(depth);
            }
            return Ok(None);
        };
        observability::set_queue_lag_ms(now_ms() - envelope.published_at_ms);

        let kind = envelope
            .diff
            .key
            .entity_kind()
            .map_or("unknown", |kind| kind.as_str());
        let op = envelope.diff.op().map_or("malformed", |op| op.as_str());
        let max_attempts = self.settings.max_attempts.max(1);

        loop {
            let started = Instant::now();
            let result = self.router.route(&envelope.diff).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            match result {
                Ok(outcome) => {
                    observability::register_diff_processed(kind, op, "ok", elapsed_ms);
                    self.queue.ack(&envelope.delivery_id).await?;
                    return Ok(Some(DeliveryOutcome::Processed(outcome)));
                }
                Err(err) if envelope.attempt < max_attempts => {
                    observability::register_diff_processed(kind, op, "retry", elapsed_ms);
                    observability::register_delivery_retried(kind);
                    let delay = backoff_ms(
                        self.settings.backoff_base_ms,
                        envelope.attempt,
                        self.settings.backoff_max_ms,
                    );
                    warn!(
                        delivery_id = %envelope.delivery_id,
                        key = %envelope.diff.key,
                        attempt = envelope.attempt,
                        delay_ms = delay,
                        error = %err,
                        "diff delivery failed; retrying"
                    );
                    sleep(Duration::from_millis(delay)).await;
                    envelope.attempt = envelope.next_attempt();
                }
                Err(err) => {
                    observability::register_diff_processed(kind, op, "dropped", elapsed_ms);
                    observability::register_delivery_dropped(kind);
                    error!(
                        delivery_id = %envelope.delivery_id,
                        key = %envelope.diff.key,
                        attempts = envelope.attempt,
                        error = %err,
                        "diff delivery exhausted retries; dropping"
                    );
                    self.queue.ack(&envelope.delivery_id).await?;
                    return Ok(Some(DeliveryOutcome::Dropped));
                }
            }
        }
    }
}

/// Runs a garbage-collection sweep every `interval` until shutdown.
pub fn spawn_gc(
    gc: GarbageCollector,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(interval) => {
                    match gc.sweep(None).await {
                        Ok(removed) => observability::register_gc_removed(removed),
                        Err(err) => error!(error = %err, "garbage collection sweep failed"),
                    }
                }
            }
        }
        debug!("garbage collector stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use ripple_domain::DomainResult;
    use ripple_domain::diff::{DiffOp, RecordDiff};
    use ripple_domain::dispatch::PostProcessor;
    use ripple_domain::error::DomainError;
    use ripple_domain::ports::BoxFuture;
    use ripple_domain::ports::stream::DiffEnvelope;
    use ripple_domain::record::{EntityKind, ItemKey, Record};
    use ripple_domain::stream::InMemoryDiffQueue;
    use tokio::sync::Notify;

    use super::*;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl PostProcessor for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn run<'a>(&'a self, _diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(DomainError::TransactionFailed("store hiccup".into()));
                }
                Ok(())
            })
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            poll_interval: Duration::from_millis(10),
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    fn post_added() -> RecordDiff {
        let key = ItemKey::root(EntityKind::Post, "p-1");
        RecordDiff::new(key.clone(), None, Some(Record::new(&key).with("postId", "p-1")))
    }

    async fn consumer_with(failures: u32) -> (Consumer, Arc<Flaky>, Arc<InMemoryDiffQueue>) {
        let handler = Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        });
        let queue = Arc::new(InMemoryDiffQueue::new());
        queue
            .enqueue(&DiffEnvelope::new("d-1".into(), post_added(), now_ms()))
            .await
            .unwrap();
        let router = DiffRouter::new().register(EntityKind::Post, handler.clone());
        (Consumer::new(router, queue.clone(), settings()), handler, queue)
    }

    #[tokio::test]
    async fn retries_until_handler_succeeds() {
        let (consumer, handler, queue) = consumer_with(2).await;
        let outcome = consumer.run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(DeliveryOutcome::Processed(RouteOutcome::Dispatched {
                kind: EntityKind::Post,
                op: DiffOp::Add,
            }))
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.requeue_processing(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drops_delivery_after_max_attempts() {
        let (consumer, handler, queue) = consumer_with(5).await;
        let outcome = consumer.run_once().await.unwrap();
        assert_eq!(outcome, Some(DeliveryOutcome::Dropped));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(consumer.run_once().await.unwrap(), None);
    }

    struct Slow {
        started: Notify,
        finished: AtomicBool,
    }

    impl PostProcessor for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn run<'a>(&'a self, _diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
            Box::pin(async move {
                self.started.notify_one();
                sleep(Duration::from_millis(50)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn shutdown_finishes_delivery_in_progress() {
        let handler = Arc::new(Slow {
            started: Notify::new(),
            finished: AtomicBool::new(false),
        });
        let queue = Arc::new(InMemoryDiffQueue::new());
        queue
            .enqueue(&DiffEnvelope::new("d-1".into(), post_added(), now_ms()))
            .await
            .unwrap();
        let router = DiffRouter::new().register(EntityKind::Post, handler.clone());
        let consumer = Consumer::new(router, queue.clone(), settings());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        handler.started.notified().await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap();

        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(queue.requeue_processing(10).await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stopped_consumer_leaves_queue_untouched() {
        let (consumer, handler, queue) = consumer_with(0).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        consumer.run(shutdown_rx).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
