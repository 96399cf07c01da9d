use reqwest::Method;
use ripple_domain::ports::BoxFuture;
use ripple_domain::ports::clients::{ClientError, SearchIndex, UserDocument};
use serde_json::json;

use crate::http::JsonHttpClient;

/// User documents in the external search index, keyed by user id.
#[derive(Debug, Clone)]
pub struct HttpSearchIndex {
    client: JsonHttpClient,
}

impl HttpSearchIndex {
    pub fn new(client: JsonHttpClient) -> Self {
        Self { client }
    }

    fn document_body(document: &UserDocument) -> serde_json::Value {
        json!({
            "userId": document.user_id,
            "username": document.username,
            "fullName": document.full_name,
        })
    }
}

impl SearchIndex for HttpSearchIndex {
    fn add_user(&self, document: &UserDocument) -> BoxFuture<'_, Result<(), ClientError>> {
        let path = format!("users/{}", document.user_id);
        let body = Self::document_body(document);
        Box::pin(async move { self.client.send(Method::PUT, &path, Some(&body)).await })
    }

    fn update_user(&self, document: &UserDocument) -> BoxFuture<'_, Result<(), ClientError>> {
        let path = format!("users/{}", document.user_id);
        let body = Self::document_body(document);
        Box::pin(async move { self.client.send(Method::PATCH, &path, Some(&body)).await })
    }

    fn delete_user(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        let path = format!("users/{user_id}");
        Box::pin(async move { self.client.send(Method::DELETE, &path, None).await })
    }
}
