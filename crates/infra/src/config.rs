use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub data_backend: String,
    pub redis_url: String,
    pub store_namespace: String,
    pub stream_queue_prefix: String,
    pub worker_poll_interval_ms: u64,
    pub worker_max_attempts: u32,
    pub worker_backoff_base_ms: u64,
    pub worker_backoff_max_ms: u64,
    pub worker_requeue_batch: usize,
    pub gc_interval_ms: u64,
    pub gc_page_size: usize,
    pub flag_admin_usernames: String,
    pub flag_min_count: i64,
    pub flag_viewer_ratio_pct: i64,
    pub search_endpoint: String,
    pub push_endpoint: String,
    pub notification_endpoint: String,
    pub http_timeout_ms: u64,
    pub http_retry_max_attempts: u32,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("data_backend", "redis")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("store_namespace", "ripple:store")?
            .set_default("stream_queue_prefix", "ripple:diffs")?
            .set_default("worker_poll_interval_ms", 1000)?
            .set_default("worker_max_attempts", 5)?
            .set_default("worker_backoff_base_ms", 200)?
            .set_default("worker_backoff_max_ms", 10000)?
            .set_default("worker_requeue_batch", 100)?
            .set_default("gc_interval_ms", 60000)?
            .set_default("gc_page_size", 100)?
            .set_default("flag_admin_usernames", "real,ian")?
            .set_default("flag_min_count", 3)?
            .set_default("flag_viewer_ratio_pct", 10)?
            .set_default("search_endpoint", "")?
            .set_default("push_endpoint", "")?
            .set_default("notification_endpoint", "")?
            .set_default("http_timeout_ms", 5000)?
            .set_default("http_retry_max_attempts", 3)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    /// Comma-separated in the environment.
    pub fn flag_admins(&self) -> Vec<String> {
        self.flag_admin_usernames
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn uses_redis_store(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("redis")
    }
}
