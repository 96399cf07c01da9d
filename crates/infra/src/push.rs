use reqwest::Method;
use ripple_domain::ports::BoxFuture;
use ripple_domain::ports::clients::{ClientError, PushChannel, PushEndpoints};
use serde_json::json;

use crate::http::JsonHttpClient;

#[derive(Debug, Clone)]
pub struct HttpPushEndpoints {
    client: JsonHttpClient,
}

impl HttpPushEndpoints {
    pub fn new(client: JsonHttpClient) -> Self {
        Self { client }
    }

    fn send(
        &self,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move { self.client.send(method, &path, body.as_ref()).await })
    }
}

impl PushEndpoints for HttpPushEndpoints {
    fn update_user_endpoint(
        &self,
        user_id: &str,
        channel: PushChannel,
        address: &str,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        self.send(
            Method::PUT,
            format!("users/{user_id}/endpoints/{}", channel.as_str()),
            Some(json!({ "address": address })),
        )
    }

    fn delete_user_endpoint(
        &self,
        user_id: &str,
        channel: PushChannel,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        self.send(
            Method::DELETE,
            format!("users/{user_id}/endpoints/{}", channel.as_str()),
            None,
        )
    }

    fn enable_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.send(
            Method::POST,
            format!("users/{user_id}/endpoints/enable"),
            None,
        )
    }

    fn disable_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.send(
            Method::POST,
            format!("users/{user_id}/endpoints/disable"),
            None,
        )
    }

    fn delete_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.send(Method::DELETE, format!("users/{user_id}/endpoints"), None)
    }
}
