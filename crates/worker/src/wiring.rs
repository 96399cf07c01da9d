use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use ripple_domain::flag::FlagPolicy;
use ripple_domain::ports::stream::DiffQueue;
use ripple_domain::wiring::{CoreServices, CoreSettings};
use ripple_infra::collaborators::build_collaborators;
use ripple_infra::config::AppConfig;
use ripple_infra::diff_queue::RedisDiffQueue;
use ripple_infra::entity_store::RedisEntityStore;
use tracing::info;

use crate::pipeline::ConsumerSettings;

pub struct WorkerState {
    pub core: CoreServices,
    pub queue: Arc<dyn DiffQueue>,
    pub consumer: ConsumerSettings,
    pub gc_interval: Duration,
}

/// The worker reads the table its producers write to. Every committed row change is queued
/// by the store itself, so the worker only consumes.
pub async fn build(config: &AppConfig) -> Result<WorkerState> {
    if !config.uses_redis_store() {
        bail!(
            "the worker needs the shared `redis` data_backend, got `{}`",
            config.data_backend
        );
    }
    let store = RedisEntityStore::connect(
        &config.redis_url,
        &config.store_namespace,
        Some(config.stream_queue_prefix.as_str()),
    )
    .await?;
    let core = CoreServices::new(
        Arc::new(store),
        build_collaborators(config),
        CoreSettings {
            gc_page_size: config.gc_page_size,
            flag_policy: FlagPolicy {
                admin_usernames: config.flag_admins(),
                min_flags: config.flag_min_count,
                viewer_ratio_pct: config.flag_viewer_ratio_pct,
            },
        },
    );

    let queue =
        RedisDiffQueue::connect_with_prefix(&config.redis_url, &config.stream_queue_prefix).await?;
    let requeued = queue.requeue_processing(config.worker_requeue_batch).await?;
    info!(
        requeued,
        namespace = %config.store_namespace,
        "redis entity store and diff queue connected"
    );

    Ok(WorkerState {
        core,
        queue: Arc::new(queue),
        consumer: ConsumerSettings {
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms.max(1)),
            max_attempts: config.worker_max_attempts.max(1),
            backoff_base_ms: config.worker_backoff_base_ms,
            backoff_max_ms: config.worker_backoff_max_ms,
        },
        gc_interval: Duration::from_millis(config.gc_interval_ms.max(1)),
    })
}
