mod observability;
mod pipeline;
mod wiring;

use ripple_infra::{config::AppConfig, logging::init_tracing};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::pipeline::{Consumer, spawn_gc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let state = wiring::build(&config).await?;
    info!(
        app_env = %config.app_env,
        data_backend = %config.data_backend,
        "worker starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc = spawn_gc(state.core.gc.clone(), state.gc_interval, shutdown_rx.clone());
    let consumer = Consumer::new(state.core.router.clone(), state.queue, state.consumer);
    let consuming = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("consumer", consuming), ("gc", gc)] {
        if let Err(err) = handle.await {
            warn!(task = name, error = %err, "worker task ended abnormally");
        }
    }
    if let Some(rendered) = observability::render_metrics() {
        info!(bytes = rendered.len(), "final metrics snapshot rendered");
    }
    info!("worker shutdown");

    Ok(())
}
