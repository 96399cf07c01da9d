use reqwest::Method;
use ripple_domain::ports::BoxFuture;
use ripple_domain::ports::clients::{CardNotification, ClientError, MessageNotification, Notifier};

use crate::http::JsonHttpClient;

/// Forwards card and chat notifications to the notification service.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: JsonHttpClient,
}

impl HttpNotifier {
    pub fn new(client: JsonHttpClient) -> Self {
        Self { client }
    }
}

impl Notifier for HttpNotifier {
    fn card_changed(
        &self,
        notification: &CardNotification,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        let body = serde_json::to_value(notification);
        Box::pin(async move {
            let body = body.map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
            self.client.send(Method::POST, "cards", Some(&body)).await
        })
    }

    fn chat_message_added(
        &self,
        notification: &MessageNotification,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        let body = serde_json::to_value(notification);
        Box::pin(async move {
            let body = body.map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
            self.client.send(Method::POST, "messages", Some(&body)).await
        })
    }
}
