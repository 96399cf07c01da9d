use std::sync::OnceLock;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const DIFFS_PROCESSED_TOTAL: &str = "ripple_worker_diffs_processed_total";
const DIFF_PROCESSING_DURATION_MS: &str = "ripple_worker_diff_processing_duration_ms";
const DELIVERIES_RETRIED_TOTAL: &str = "ripple_worker_deliveries_retried_total";
const DELIVERIES_DROPPED_TOTAL: &str = "ripple_worker_deliveries_dropped_total";
const GC_REMOVED_TOTAL: &str = "ripple_worker_gc_removed_total";
const QUEUE_DEPTH_GAUGE: &str = "ripple_worker_queue_ready_total";
const QUEUE_LAG_GAUGE: &str = "ripple_worker_queue_lag_ms";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_diff_processed(kind: &str, op: &str, result: &str, duration_ms: f64) {
    counter!(
        DIFFS_PROCESSED_TOTAL,
        "kind" => kind.to_string(),
        "op" => op.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        DIFF_PROCESSING_DURATION_MS,
        "kind" => kind.to_string()
    )
    .record(duration_ms.max(0.0));
}

pub fn register_delivery_retried(kind: &str) {
    counter!(DELIVERIES_RETRIED_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn register_delivery_dropped(kind: &str) {
    counter!(DELIVERIES_DROPPED_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn register_gc_removed(removed: usize) {
    counter!(GC_REMOVED_TOTAL).increment(removed as u64);
}

pub fn set_queue_depth(ready: usize) {
    gauge!(QUEUE_DEPTH_GAUGE).set(ready as f64);
}

pub fn set_queue_lag_ms(lag_ms: i64) {
    gauge!(QUEUE_LAG_GAUGE).set(lag_ms.max(0) as f64);
}
