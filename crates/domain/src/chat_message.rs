use std::sync::Arc;

use tracing::{debug, info};

use crate::DomainResult;
use crate::chat::ChatPostProcessor;
use crate::diff::{Change, FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::error::DomainError;
use crate::flag::FlagCounter;
use crate::ports::BoxFuture;
use crate::ports::store::{
    Condition, EntityStore, Index, KeyRange, PageRequest, ReadConsistency, StoreError, WriteOp,
};
use crate::record::{EntityKind, ItemKey, Record, RowKind};
use crate::transaction::{MutationError, TransactionCoordinator};
use crate::util::new_id;

const MESSAGE_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub message_id: String,
    pub chat_id: String,
    /// Absent for system messages.
    pub user_id: Option<String>,
    pub created_at: i64,
    pub text: Option<String>,
    pub notify_user_ids: Vec<String>,
}

impl ChatMessage {
    pub fn key(&self) -> ItemKey {
        ItemKey::root(EntityKind::ChatMessage, &self.message_id)
    }

    pub fn is_system(&self) -> bool {
        self.user_id.is_none()
    }
}

impl FromRecord for ChatMessage {
    fn from_record(record: &Record) -> DomainResult<Self> {
        Ok(Self {
            message_id: record.require_str("messageId")?,
            chat_id: record.require_str("chatId")?,
            user_id: record.get_str("userId").map(ToString::to_string),
            created_at: record.require_i64("createdAt")?,
            text: record.get_str("text").map(ToString::to_string),
            notify_user_ids: record.get_string_list("notifyUserIds"),
        })
    }
}

#[derive(Clone)]
pub struct ChatMessageService {
    store: Arc<dyn EntityStore>,
    transactions: TransactionCoordinator,
}

impl ChatMessageService {
    pub fn new(store: Arc<dyn EntityStore>, transactions: TransactionCoordinator) -> Self {
        Self {
            store,
            transactions,
        }
    }

    pub async fn get_chat_message(&self, message_id: &str) -> DomainResult<Option<ChatMessage>> {
        self.store
            .get(
                &ItemKey::root(EntityKind::ChatMessage, message_id),
                ReadConsistency::Strong,
            )
            .await?
            .as_ref()
            .map(ChatMessage::from_record)
            .transpose()
    }

    fn message_record(
        message_id: &str,
        chat_id: &str,
        user_id: Option<&str>,
        text: &str,
        now_ms: i64,
    ) -> Record {
        let mut item = Record::new(&ItemKey::root(EntityKind::ChatMessage, message_id))
            .with("messageId", message_id)
            .with("chatId", chat_id)
            .with("createdAt", now_ms)
            .with("text", text)
            .with("gsiA1PartitionKey", format!("chatMessage/{chat_id}"))
            .with("gsiA1SortKey", now_ms);
        if let Some(user_id) = user_id {
            item.set("userId", user_id);
        }
        item
    }

    /// Adds a message authored by a current member of the chat.
    pub async fn add_chat_message(
        &self,
        message_id: &str,
        chat_id: &str,
        user_id: &str,
        text: &str,
        now_ms: i64,
    ) -> DomainResult<ChatMessage> {
        let item = Self::message_record(message_id, chat_id, Some(user_id), text, now_ms);
        let key = ItemKey::root(EntityKind::ChatMessage, message_id);
        let writes = [
            WriteOp::put_new(item),
            WriteOp::ConditionCheck {
                key: ItemKey::sub_row(EntityKind::Chat, chat_id, format!("member/{user_id}")),
                condition: Condition::Exists,
            },
        ];
        let errors = [
            MutationError::new(
                EntityKind::ChatMessage,
                format!("Unable to add chat message with id `{message_id}`... id already used?"),
            ),
            MutationError::new(
                EntityKind::ChatMessage,
                format!("User `{user_id}` is not a member of chat `{chat_id}`"),
            ),
        ];
        let record = self
            .transactions
            .transact_and_read(&writes, &errors, &key)
            .await?;
        ChatMessage::from_record(&record)
    }

    /// System messages have no author; `notify_user_ids` receive the notification.
    pub async fn add_system_message(
        &self,
        chat_id: &str,
        text: &str,
        notify_user_ids: &[String],
        now_ms: i64,
    ) -> DomainResult<ChatMessage> {
        let message_id = new_id();
        let mut item = Self::message_record(&message_id, chat_id, None, text, now_ms);
        if !notify_user_ids.is_empty() {
            item.set("notifyUserIds", notify_user_ids.to_vec());
        }
        let key = ItemKey::root(EntityKind::ChatMessage, &message_id);
        let writes = [
            WriteOp::put_new(item),
            WriteOp::ConditionCheck {
                key: ItemKey::root(EntityKind::Chat, chat_id),
                condition: Condition::Exists,
            },
        ];
        let errors = [
            MutationError::new(
                EntityKind::ChatMessage,
                format!("Unable to add chat message with id `{message_id}`... id already used?"),
            ),
            MutationError::new(
                EntityKind::ChatMessage,
                format!("Unable to add system message to chat `{chat_id}`... chat does not exist?"),
            ),
        ];
        let record = self
            .transactions
            .transact_and_read(&writes, &errors, &key)
            .await?;
        info!(%chat_id, %message_id, "system message added");
        ChatMessage::from_record(&record)
    }

    /// Only the author may delete a user message.
    pub async fn delete_chat_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> DomainResult<ChatMessage> {
        let message = self
            .get_chat_message(message_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if message.user_id.as_deref() != Some(user_id) {
            return Err(DomainError::Validation(format!(
                "User `{user_id}` is not authorized to delete chat message `{message_id}`"
            )));
        }
        match self.store.delete(&message.key(), Some(&Condition::Exists)).await {
            Ok(_) => Ok(message),
            Err(StoreError::ConditionFailed) => Err(DomainError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes every message of a chat.
    pub async fn truncate_chat_messages(&self, chat_id: &str) -> DomainResult<usize> {
        let partition = format!("chatMessage/{chat_id}");
        let mut deleted = 0;
        loop {
            let page = self
                .store
                .query_index(
                    Index::A1,
                    &partition,
                    &KeyRange::all(),
                    &PageRequest::first(MESSAGE_PAGE_SIZE),
                )
                .await?;
            let mut removed = 0;
            for record in &page.items {
                if let Some(key) = record.key() {
                    if self.store.delete(&key, None).await?.is_some() {
                        removed += 1;
                    }
                }
            }
            if removed == 0 {
                debug!(%chat_id, deleted, "chat messages truncated");
                return Ok(deleted);
            }
            deleted += removed;
        }
    }
}

pub struct ChatMessagePostProcessor {
    chat: Arc<ChatPostProcessor>,
    flags: FlagCounter,
}

impl ChatMessagePostProcessor {
    pub fn new(chat: Arc<ChatPostProcessor>, flags: FlagCounter) -> Self {
        Self { chat, flags }
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        match diff.key.row_kind() {
            RowKind::Root => {}
            // Flagged messages are only counted, never removed.
            RowKind::Flag(_) => return self.flags.flag_changed(diff).await.map(drop),
            _ => return Ok(()),
        }
        match diff.typed::<ChatMessage>()? {
            Change::Added(message) => {
                debug!(message_id = %message.message_id, system = message.is_system(), "chat message added");
                self.chat.chat_message_added(diff, &message).await
            }
            Change::Deleted(message) => {
                self.flags
                    .clear(EntityKind::ChatMessage, &message.message_id)
                    .await?;
                self.chat.chat_message_deleted(diff, &message).await
            }
            Change::Edited { .. } => Ok(()),
        }
    }
}

impl PostProcessor for ChatMessagePostProcessor {
    fn name(&self) -> &'static str {
        "chat_message"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}
