use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("client unavailable: {0}")]
    Unavailable(String),
    #[error("client rejected request: {0}")]
    Rejected(String),
    #[error("client response invalid: {0}")]
    InvalidResponse(String),
}

/// Search document derived from a user profile row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserDocument {
    pub user_id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum PushChannel {
    Email,
    Sms,
}

impl PushChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }

    /// Profile attribute holding this channel's address.
    pub fn attribute(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "phoneNumber",
        }
    }

    pub fn all() -> [PushChannel; 2] {
        [Self::Email, Self::Sms]
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CardChange {
    Added,
    Deleted,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CardNotification {
    pub change: CardChange,
    pub user_id: String,
    pub card_id: String,
    pub title: Option<String>,
    pub action: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageNotification {
    pub user_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub author_user_id: Option<String>,
    pub text: Option<String>,
    pub created_at: i64,
}

pub trait SearchIndex: Send + Sync {
    fn add_user(&self, document: &UserDocument) -> BoxFuture<'_, Result<(), ClientError>>;
    fn update_user(&self, document: &UserDocument) -> BoxFuture<'_, Result<(), ClientError>>;
    fn delete_user(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>>;
}

pub trait PushEndpoints: Send + Sync {
    fn update_user_endpoint(
        &self,
        user_id: &str,
        channel: PushChannel,
        address: &str,
    ) -> BoxFuture<'_, Result<(), ClientError>>;
    fn delete_user_endpoint(
        &self,
        user_id: &str,
        channel: PushChannel,
    ) -> BoxFuture<'_, Result<(), ClientError>>;
    fn enable_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>>;
    fn disable_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>>;
    fn delete_user_endpoints(&self, user_id: &str) -> BoxFuture<'_, Result<(), ClientError>>;
}

pub trait Notifier: Send + Sync {
    fn card_changed(
        &self,
        notification: &CardNotification,
    ) -> BoxFuture<'_, Result<(), ClientError>>;
    fn chat_message_added(
        &self,
        notification: &MessageNotification,
    ) -> BoxFuture<'_, Result<(), ClientError>>;
}
