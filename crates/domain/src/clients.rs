use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::ports::BoxFuture;
use crate::ports::clients::{
    CardNotification, ClientError, MessageNotification, Notifier, PushChannel, PushEndpoints,
    SearchIndex, UserDocument,
};

#[derive(Clone, Debug, PartialEq)]
pub enum ClientCall {
    SearchAdd(UserDocument),
    SearchUpdate(UserDocument),
    SearchDelete(String),
    EndpointUpdate {
        user_id: String,
        channel: PushChannel,
        address: String,
    },
    EndpointDelete {
        user_id: String,
        channel: PushChannel,
    },
    EndpointsEnable(String),
    EndpointsDisable(String),
    EndpointsDelete(String),
    CardChanged(CardNotification),
    MessageAdded(MessageNotification),
}

/// Collaborator stand-in that records every call, used in development mode and tests.
#[derive(Clone, Default)]
pub struct InMemoryClients {
    calls: Arc<Mutex<Vec<ClientCall>>>,
}

impl InMemoryClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: ClientCall) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            debug!(?call, "collaborator call recorded");
            self.calls
                .lock()
                .map_err(|_| ClientError::Unavailable("client log lock poisoned".into()))?
                .push(call);
            Ok(())
        })
    }
}

impl SearchIndex for InMemoryClients {
    fn add_user(&self, document: &UserDocument) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::SearchAdd(document.clone()))
    }

    fn update_user(&self, document: &UserDocument) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::SearchUpdate(document.clone()))
    }

    fn delete_user(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::SearchDelete(user_id.to_string()))
    }
}

impl PushEndpoints for InMemoryClients {
    fn update_user_endpoint(
        &self,
        user_id: &str,
        channel: PushChannel,
        address: &str,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::EndpointUpdate {
            user_id: user_id.to_string(),
            channel,
            address: address.to_string(),
        })
    }

    fn delete_user_endpoint(
        &self,
        user_id: &str,
        channel: PushChannel,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::EndpointDelete {
            user_id: user_id.to_string(),
            channel,
        })
    }

    fn enable_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::EndpointsEnable(user_id.to_string()))
    }

    fn disable_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::EndpointsDisable(user_id.to_string()))
    }

    fn delete_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::EndpointsDelete(user_id.to_string()))
    }
}

impl Notifier for InMemoryClients {
    fn card_changed(
        &self,
        notification: &CardNotification,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::CardChanged(notification.clone()))
    }

    fn chat_message_added(
        &self,
        notification: &MessageNotification,
    ) -> BoxFuture<'_, Result<(), ClientError>> {
        self.record(ClientCall::MessageAdded(notification.clone()))
    }
}
