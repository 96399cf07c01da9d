use std::time::Duration;

use reqwest::{Method, StatusCode};
use ripple_domain::ports::clients::ClientError;
use ripple_domain::util::backoff_ms;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;

const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 2_000;

/// JSON-over-HTTP transport shared by the collaborator clients. Transport errors, 429 and
/// 5xx responses are retried with exponential backoff.
#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    http: reqwest::Client,
    base_url: String,
    retry_max_attempts: u32,
}

impl JsonHttpClient {
    pub fn new(config: &AppConfig, base_url: &str) -> Self {
        let timeout = Duration::from_millis(config.http_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_max_attempts: config.http_retry_max_attempts.max(1),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends the request; a 404 answer to a DELETE counts as success.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(), ClientError> {
        let attempts = self.retry_max_attempts;
        let url = endpoint_url(&self.base_url, path);

        for attempt in 1..=attempts {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    if attempt < attempts {
                        self.pause(attempt, &url, &err.to_string()).await;
                        continue;
                    }
                    return Err(ClientError::Unavailable(err.to_string()));
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!(%url, method = %method, status = status.as_u16(), "collaborator call succeeded");
                return Ok(());
            }
            if status == StatusCode::NOT_FOUND && method == Method::DELETE {
                debug!(%url, "collaborator resource already gone");
                return Ok(());
            }

            let message = response.text().await.unwrap_or_default();
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < attempts {
                self.pause(attempt, &url, &format!("status {}", status.as_u16()))
                    .await;
                continue;
            }
            let reason = format!("status {}: {}", status.as_u16(), message);
            return Err(if retryable {
                ClientError::Unavailable(reason)
            } else {
                ClientError::Rejected(reason)
            });
        }

        Err(ClientError::Unavailable(
            "retry loop exited unexpectedly".to_string(),
        ))
    }

    async fn pause(&self, attempt: u32, url: &str, reason: &str) {
        let delay = backoff_ms(RETRY_BACKOFF_BASE_MS, attempt, RETRY_BACKOFF_MAX_MS);
        warn!(%url, attempt, delay_ms = delay, reason, "collaborator call failed; retrying");
        sleep(Duration::from_millis(delay)).await;
    }
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_joins_without_double_slash() {
        assert_eq!(
            endpoint_url("http://search.local/", "/users/u-1"),
            "http://search.local/users/u-1"
        );
    }
}
