use std::sync::Arc;

use ripple_domain::clients::InMemoryClients;
use ripple_domain::wiring::Collaborators;
use tracing::info;

use crate::config::AppConfig;
use crate::http::JsonHttpClient;
use crate::notify::HttpNotifier;
use crate::push::HttpPushEndpoints;
use crate::search::HttpSearchIndex;

/// HTTP clients for every configured endpoint; collaborators without one record their
/// calls in memory.
pub fn build_collaborators(config: &AppConfig) -> Collaborators {
    let recorder = InMemoryClients::new();
    let endpoint = |name: &str, value: &str| {
        let value = value.trim();
        if value.is_empty() {
            info!(collaborator = name, "no endpoint configured; using in-memory client");
            None
        } else {
            info!(collaborator = name, endpoint = value, "using http client");
            Some(JsonHttpClient::new(config, value))
        }
    };

    Collaborators {
        search: match endpoint("search", &config.search_endpoint) {
            Some(client) => Arc::new(HttpSearchIndex::new(client)),
            None => Arc::new(recorder.clone()),
        },
        push: match endpoint("push", &config.push_endpoint) {
            Some(client) => Arc::new(HttpPushEndpoints::new(client)),
            None => Arc::new(recorder.clone()),
        },
        notifier: match endpoint("notification", &config.notification_endpoint) {
            Some(client) => Arc::new(HttpNotifier::new(client)),
            None => Arc::new(recorder),
        },
    }
}
