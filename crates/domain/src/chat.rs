use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::aggregate::{AggregateUpdate, AggregateWriter, Crossing, RaceReason, UpdateOutcome};
use crate::chat_message::{ChatMessage, ChatMessageService};
use crate::diff::{FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::clients::{MessageNotification, Notifier};
use crate::ports::store::{
    CompareOp, Condition, EntityStore, Index, KeyRange, PageRequest, ReadConsistency, UpdateItem,
    WriteOp,
};
use crate::record::{EntityKind, ItemKey, Record, RowKind};
use crate::transaction::{MutationError, TransactionCoordinator};
use crate::util::collapse_counts;

pub const MESSAGES_UNVIEWED_COUNT: &str = "messagesUnviewedCount";
pub const LAST_MESSAGE_ACTIVITY_AT: &str = "lastMessageActivityAt";
pub const LAST_VIEWED_AT: &str = "lastViewedAt";
const MEMBER_PREFIX: &str = "member/";
const MEMBER_PAGE_SIZE: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatType {
    Direct,
    Group,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "DIRECT",
            Self::Group => "GROUP",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chat {
    pub chat_id: String,
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub created_by_user_id: String,
    pub user_count: i64,
    pub messages_count: i64,
    pub last_message_activity_at: Option<i64>,
    /// Both participants of a direct chat, sorted.
    pub direct_user_ids: Option<(String, String)>,
}

impl Chat {
    pub fn key(&self) -> ItemKey {
        ItemKey::root(EntityKind::Chat, &self.chat_id)
    }
}

impl FromRecord for Chat {
    fn from_record(record: &Record) -> DomainResult<Self> {
        let chat_type = match record.require_str("chatType")?.as_str() {
            "DIRECT" => ChatType::Direct,
            "GROUP" => ChatType::Group,
            other => {
                return Err(DomainError::MalformedRecord(format!(
                    "unknown chat type `{other}`"
                )));
            }
        };
        let direct_user_ids = record
            .get_str("gsiA1PartitionKey")
            .and_then(|value| value.strip_prefix("chat/"))
            .and_then(|value| value.split_once('/'))
            .map(|(first, second)| (first.to_string(), second.to_string()));
        Ok(Self {
            chat_id: record.require_str("chatId")?,
            chat_type,
            name: record.get_str("name").map(ToString::to_string),
            created_by_user_id: record.require_str("createdByUserId")?,
            user_count: record.count("userCount"),
            messages_count: record.count("messagesCount"),
            last_message_activity_at: record.get_i64(LAST_MESSAGE_ACTIVITY_AT),
            direct_user_ids,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMember {
    pub chat_id: String,
    pub user_id: String,
    pub messages_unviewed_count: i64,
    pub last_viewed_at: Option<i64>,
}

impl ChatMember {
    pub fn key(&self) -> ItemKey {
        member_key(&self.chat_id, &self.user_id)
    }
}

impl FromRecord for ChatMember {
    fn from_record(record: &Record) -> DomainResult<Self> {
        Ok(Self {
            chat_id: record.require_str("chatId")?,
            user_id: record.require_str("userId")?,
            messages_unviewed_count: record.count(MESSAGES_UNVIEWED_COUNT),
            last_viewed_at: record.get_i64(LAST_VIEWED_AT),
        })
    }
}

pub fn member_key(chat_id: &str, user_id: &str) -> ItemKey {
    ItemKey::sub_row(EntityKind::Chat, chat_id, format!("{MEMBER_PREFIX}{user_id}"))
}

fn direct_partition(user_id_1: &str, user_id_2: &str) -> String {
    let (first, second) = if user_id_1 <= user_id_2 {
        (user_id_1, user_id_2)
    } else {
        (user_id_2, user_id_1)
    };
    format!("chat/{first}/{second}")
}

async fn load_chat(store: &dyn EntityStore, chat_id: &str) -> DomainResult<Option<Chat>> {
    store
        .get(&ItemKey::root(EntityKind::Chat, chat_id), ReadConsistency::Strong)
        .await?
        .as_ref()
        .map(Chat::from_record)
        .transpose()
}

async fn load_members(store: &dyn EntityStore, chat_id: &str) -> DomainResult<Vec<ChatMember>> {
    let partition = ItemKey::root(EntityKind::Chat, chat_id).partition_key;
    let mut page = PageRequest::first(MEMBER_PAGE_SIZE);
    let mut members = Vec::new();
    loop {
        let result = store
            .query_partition(&partition, Some(MEMBER_PREFIX), &page)
            .await?;
        for record in &result.items {
            members.push(ChatMember::from_record(record)?);
        }
        match result.next_cursor {
            Some(cursor) => page = page.next(cursor),
            None => return Ok(members),
        }
    }
}

fn member_record(chat_id: &str, user_id: &str, now_ms: i64) -> Record {
    Record::new(&member_key(chat_id, user_id))
        .with("chatId", chat_id)
        .with("userId", user_id)
        .with("joinedAt", now_ms)
        .with(LAST_VIEWED_AT, now_ms)
        .with(MESSAGES_UNVIEWED_COUNT, 0)
}

fn increment_chat_count(user_id: &str) -> WriteOp {
    WriteOp::Update(
        UpdateItem::new(ItemKey::root(EntityKind::User, user_id))
            .add("chatCount", 1)
            .when(Condition::Exists),
    )
}

fn decrement_chat_count(user_id: &str) -> WriteOp {
    WriteOp::Update(
        UpdateItem::new(ItemKey::root(EntityKind::User, user_id))
            .add("chatCount", -1)
            .when(Condition::Exists)
            .when(Condition::at_least("chatCount", 1)),
    )
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn EntityStore>,
    transactions: TransactionCoordinator,
    writer: AggregateWriter,
    messages: ChatMessageService,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        transactions: TransactionCoordinator,
        writer: AggregateWriter,
        messages: ChatMessageService,
    ) -> Self {
        Self {
            store,
            transactions,
            writer,
            messages,
        }
    }

    pub async fn get_chat(&self, chat_id: &str) -> DomainResult<Option<Chat>> {
        load_chat(self.store.as_ref(), chat_id).await
    }

    pub async fn get_member(&self, chat_id: &str, user_id: &str) -> DomainResult<Option<ChatMember>> {
        self.store
            .get(&member_key(chat_id, user_id), ReadConsistency::Strong)
            .await?
            .as_ref()
            .map(ChatMember::from_record)
            .transpose()
    }

    pub async fn get_direct_chat(&self, user_id_1: &str, user_id_2: &str) -> DomainResult<Option<Chat>> {
        let page = self
            .store
            .query_index(
                Index::A1,
                &direct_partition(user_id_1, user_id_2),
                &KeyRange::all(),
                &PageRequest::first(1),
            )
            .await?;
        page.items.first().map(Chat::from_record).transpose()
    }

    pub async fn add_direct_chat(
        &self,
        chat_id: &str,
        created_by_user_id: &str,
        with_user_id: &str,
        now_ms: i64,
    ) -> DomainResult<Chat> {
        if created_by_user_id == with_user_id {
            return Err(DomainError::Validation(format!(
                "User `{created_by_user_id}` cannot open direct chat with themselves"
            )));
        }
        if self.get_direct_chat(created_by_user_id, with_user_id).await?.is_some() {
            return Err(MutationError::new(
                EntityKind::Chat,
                format!("Chat already exists between user `{created_by_user_id}` and user `{with_user_id}`"),
            )
            .into());
        }

        let key = ItemKey::root(EntityKind::Chat, chat_id);
        let chat = Record::new(&key)
            .with("chatId", chat_id)
            .with("chatType", ChatType::Direct.as_str())
            .with("createdByUserId", created_by_user_id)
            .with("createdAt", now_ms)
            .with("userCount", 2)
            .with("gsiA1PartitionKey", direct_partition(created_by_user_id, with_user_id))
            .with("gsiA1SortKey", now_ms);
        let writes = [
            WriteOp::put_new(chat),
            WriteOp::put_new(member_record(chat_id, created_by_user_id, now_ms)),
            WriteOp::put_new(member_record(chat_id, with_user_id, now_ms)),
            increment_chat_count(created_by_user_id),
            increment_chat_count(with_user_id),
        ];
        let errors = [
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to add chat with id `{chat_id}`... id already used?"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to add user `{created_by_user_id}` to chat `{chat_id}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to add user `{with_user_id}` to chat `{chat_id}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to increment User.chatCount for user `{created_by_user_id}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to increment User.chatCount for user `{with_user_id}`"),
            ),
        ];
        let record = self
            .transactions
            .transact_and_read(&writes, &errors, &key)
            .await?;
        info!(%chat_id, %created_by_user_id, %with_user_id, "direct chat added");
        Chat::from_record(&record)
    }

    pub async fn add_group_chat(
        &self,
        chat_id: &str,
        created_by_user_id: &str,
        name: Option<&str>,
        now_ms: i64,
    ) -> DomainResult<Chat> {
        let key = ItemKey::root(EntityKind::Chat, chat_id);
        let mut chat = Record::new(&key)
            .with("chatId", chat_id)
            .with("chatType", ChatType::Group.as_str())
            .with("createdByUserId", created_by_user_id)
            .with("createdAt", now_ms)
            .with("userCount", 1);
        if let Some(name) = name {
            chat.set("name", name);
        }
        let writes = [
            WriteOp::put_new(chat),
            WriteOp::put_new(member_record(chat_id, created_by_user_id, now_ms)),
            increment_chat_count(created_by_user_id),
        ];
        let errors = [
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to add chat with id `{chat_id}`... id already used?"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to add user `{created_by_user_id}` to chat `{chat_id}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to increment User.chatCount for user `{created_by_user_id}`"),
            ),
        ];
        let record = self
            .transactions
            .transact_and_read(&writes, &errors, &key)
            .await?;

        let username = self
            .store
            .get(&ItemKey::root(EntityKind::User, created_by_user_id), ReadConsistency::Eventual)
            .await?
            .and_then(|user| user.get_str("username").map(ToString::to_string))
            .unwrap_or_else(|| created_by_user_id.to_string());
        let mut text = format!("@{username} created the group");
        if let Some(name) = name {
            text.push_str(&format!(" \"{name}\""));
        }
        self.messages
            .add_system_message(chat_id, &text, &[created_by_user_id.to_string()], now_ms)
            .await?;
        info!(%chat_id, %created_by_user_id, "group chat added");
        Chat::from_record(&record)
    }

    /// Deletes the chat with both memberships, then its messages.
    pub async fn delete_direct_chat(
        &self,
        chat_id: &str,
        leaving_user_id: Option<&str>,
    ) -> DomainResult<()> {
        let chat = self.get_chat(chat_id).await?.ok_or(DomainError::NotFound)?;
        let Some((first, second)) = chat.direct_user_ids.clone() else {
            return Err(DomainError::Validation(format!(
                "Chat `{chat_id}` is not a direct chat"
            )));
        };
        if let Some(user_id) = leaving_user_id {
            if user_id != first && user_id != second {
                return Err(DomainError::Validation(format!(
                    "User `{user_id}` not authorized to delete chat `{chat_id}`"
                )));
            }
        }

        let writes = [
            WriteOp::delete_existing(chat.key()),
            WriteOp::delete_existing(member_key(chat_id, &first)),
            WriteOp::delete_existing(member_key(chat_id, &second)),
            decrement_chat_count(&first),
            decrement_chat_count(&second),
        ];
        let errors = [
            MutationError::new(EntityKind::Chat, format!("Unable to delete chat `{chat_id}`")),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to remove user `{first}` from chat `{chat_id}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to remove user `{second}` from chat `{chat_id}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to decrement User.chatCount for user `{first}`"),
            ),
            MutationError::new(
                EntityKind::Chat,
                format!("Unable to decrement User.chatCount for user `{second}`"),
            ),
        ];
        self.transactions.transact_write(&writes, &errors).await?;
        let deleted = self.messages.truncate_chat_messages(chat_id).await?;
        info!(%chat_id, deleted_messages = deleted, "direct chat deleted");
        Ok(())
    }

    /// Each occurrence of a chat id is one newly viewed message.
    pub async fn record_views(
        &self,
        chat_ids: &[String],
        user_id: &str,
        viewed_at: i64,
    ) -> DomainResult<()> {
        for (chat_id, count) in collapse_counts(chat_ids) {
            if self.get_chat(&chat_id).await?.is_none() {
                warn!(%chat_id, %user_id, "Cannot record view(s) by user `{user_id}` on DNE chat `{chat_id}`");
                continue;
            }
            let Some(member) = self.get_member(&chat_id, user_id).await? else {
                warn!(%chat_id, %user_id, "Cannot record view(s) by non-member user `{user_id}` on chat `{chat_id}`");
                continue;
            };
            self.record_view_count(&member, count, viewed_at).await?;
        }
        Ok(())
    }

    async fn record_view_count(&self, member: &ChatMember, count: i64, viewed_at: i64) -> DomainResult<()> {
        let key = member.key();
        let outcome = self
            .writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .add(MESSAGES_UNVIEWED_COUNT, -count)
                    .set(LAST_VIEWED_AT, viewed_at),
            )
            .await?;
        if let UpdateOutcome::SkippedRace(RaceReason::BelowFloor) = outcome {
            outcome.log_skipped(
                &key,
                &format!(
                    "Failed to decrement messages unviewed count by {count} for user `{}` in chat `{}`",
                    member.user_id, member.chat_id
                ),
            );
            // Everything is viewed now; settle at zero instead.
            let settled = self
                .writer
                .apply(
                    AggregateUpdate::new(key.clone())
                        .set(MESSAGES_UNVIEWED_COUNT, 0)
                        .set(LAST_VIEWED_AT, viewed_at)
                        .when(Condition::compare(MESSAGES_UNVIEWED_COUNT, CompareOp::Lt, count)),
                )
                .await?;
            if !settled.is_applied() {
                debug!(chat_id = %member.chat_id, user_id = %member.user_id, "unviewed count changed while settling");
            }
        } else {
            outcome.log_skipped(&key, "Failed to record chat view");
        }
        Ok(())
    }
}

/// Maintains chat and membership aggregates driven by chat and message diffs.
pub struct ChatPostProcessor {
    writer: AggregateWriter,
    notifier: Arc<dyn Notifier>,
}

impl ChatPostProcessor {
    pub fn new(writer: AggregateWriter, notifier: Arc<dyn Notifier>) -> Self {
        Self { writer, notifier }
    }

    fn store(&self) -> &dyn EntityStore {
        self.writer.store().as_ref()
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        match diff.key.row_kind() {
            RowKind::Member(user_id) => self.member_changed(diff, user_id).await,
            _ => Ok(()),
        }
    }

    /// A member's unviewed count crossing zero moves the user's count of chats with
    /// unviewed messages.
    async fn member_changed(&self, diff: &RecordDiff, user_id: &str) -> DomainResult<()> {
        let change = diff.typed::<ChatMember>()?;
        let old = change.before().map_or(0, |member| member.messages_unviewed_count);
        let new = change.after().map_or(0, |member| member.messages_unviewed_count);
        let amount = match Crossing::between(old, new) {
            Some(Crossing::Rose) => 1,
            Some(Crossing::Fell) => -1,
            None => return Ok(()),
        };
        let user_key = ItemKey::root(EntityKind::User, user_id);
        let verb = if amount > 0 { "increment" } else { "decrement" };
        self.writer
            .apply(
                AggregateUpdate::new(user_key.clone())
                    .delta(diff.delta_id("user_chats_with_unviewed_messages")?)
                    .add("chatsWithUnviewedMessagesCount", amount),
            )
            .await?
            .log_skipped(
                &user_key,
                &format!("Failed to {verb} chats with unviewed messages count for user `{user_id}`"),
            );
        Ok(())
    }

    pub async fn chat_message_added(&self, diff: &RecordDiff, message: &ChatMessage) -> DomainResult<()> {
        let chat_key = ItemKey::root(EntityKind::Chat, &message.chat_id);
        self.writer
            .apply(
                AggregateUpdate::new(chat_key.clone())
                    .delta(diff.delta_id("chat_messages_count")?)
                    .add("messagesCount", 1),
            )
            .await?
            .log_skipped(
                &chat_key,
                &format!("Failed to increment messages count for chat `{}`", message.chat_id),
            );
        self.advance_activity(chat_key, message.created_at).await?;

        let members = load_members(self.store(), &message.chat_id).await?;
        for member in &members {
            self.advance_activity(member.key(), message.created_at).await?;
        }

        let recipients: Vec<String> = match &message.user_id {
            Some(author) => {
                for member in members.iter().filter(|member| &member.user_id != author) {
                    let key = member.key();
                    // A member who already viewed the chat past this message has nothing to count.
                    let outcome = self
                        .writer
                        .apply(
                            AggregateUpdate::new(key.clone())
                                .delta(diff.delta_id(&format!("member_unviewed_added/{}", member.user_id))?)
                                .add(MESSAGES_UNVIEWED_COUNT, 1)
                                .when(Condition::Any(vec![
                                    Condition::missing(LAST_VIEWED_AT),
                                    Condition::compare(LAST_VIEWED_AT, CompareOp::Lt, message.created_at),
                                ])),
                        )
                        .await?;
                    if outcome == UpdateOutcome::SkippedRace(RaceReason::ConditionNotMet) {
                        debug!(
                            chat_id = %message.chat_id,
                            user_id = %member.user_id,
                            message_id = %message.message_id,
                            "member viewed chat after message was sent"
                        );
                        continue;
                    }
                    outcome.log_skipped(
                        &key,
                        &format!(
                            "Failed to increment messages unviewed count for user `{}` in chat `{}`",
                            member.user_id, message.chat_id
                        ),
                    );
                }
                members
                    .iter()
                    .filter(|member| &member.user_id != author)
                    .map(|member| member.user_id.clone())
                    .collect()
            }
            None => message.notify_user_ids.clone(),
        };

        for user_id in recipients {
            self.notifier
                .chat_message_added(&MessageNotification {
                    user_id,
                    chat_id: message.chat_id.clone(),
                    message_id: message.message_id.clone(),
                    author_user_id: message.user_id.clone(),
                    text: message.text.clone(),
                    created_at: message.created_at,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn chat_message_deleted(&self, diff: &RecordDiff, message: &ChatMessage) -> DomainResult<()> {
        let chat_key = ItemKey::root(EntityKind::Chat, &message.chat_id);
        self.writer
            .apply(
                AggregateUpdate::new(chat_key.clone())
                    .delta(diff.delta_id("chat_messages_count")?)
                    .add("messagesCount", -1),
            )
            .await?
            .log_skipped(
                &chat_key,
                &format!("Failed to decrement messages count for chat `{}`", message.chat_id),
            );

        let Some(author) = &message.user_id else {
            return Ok(());
        };
        for member in load_members(self.store(), &message.chat_id).await? {
            if &member.user_id == author {
                continue;
            }
            // Members who viewed the chat after the message was sent already counted it.
            if member.last_viewed_at.is_some_and(|viewed| viewed >= message.created_at) {
                continue;
            }
            let key = member.key();
            self.writer
                .apply(
                    AggregateUpdate::new(key.clone())
                        .delta(diff.delta_id(&format!("member_unviewed_deleted/{}", member.user_id))?)
                        .add(MESSAGES_UNVIEWED_COUNT, -1),
                )
                .await?
                .log_skipped(
                    &key,
                    &format!(
                        "Failed to decrement messages unviewed count for user `{}` in chat `{}`",
                        member.user_id, message.chat_id
                    ),
                );
        }
        Ok(())
    }

    /// Moves `lastMessageActivityAt` forward only.
    async fn advance_activity(&self, key: ItemKey, at: i64) -> DomainResult<()> {
        let outcome = self
            .writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .set(LAST_MESSAGE_ACTIVITY_AT, at)
                    .when(Condition::Any(vec![
                        Condition::missing(LAST_MESSAGE_ACTIVITY_AT),
                        Condition::compare(LAST_MESSAGE_ACTIVITY_AT, CompareOp::Lt, at),
                    ])),
            )
            .await?;
        if !outcome.is_applied() {
            debug!(%key, at, "message activity already at or past timestamp");
        }
        Ok(())
    }
}

impl PostProcessor for ChatPostProcessor {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}
