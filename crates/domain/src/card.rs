use std::sync::Arc;

use tracing::{debug, info};

use crate::DomainResult;
use crate::aggregate::{AggregateUpdate, AggregateWriter};
use crate::diff::{Change, FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::ports::BoxFuture;
use crate::ports::clients::{CardChange, CardNotification, Notifier};
use crate::ports::store::{Condition, EntityStore, Index, KeyRange, PageRequest, StoreError};
use crate::record::{EntityKind, ItemKey, Record, RowKind};

const CARD_PAGE_SIZE: usize = 100;

/// Deterministic identity of a well-known card.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CardSpec {
    CommentActivity { user_id: String, post_id: String },
    ChatActivity { user_id: String },
    RequestedFollowers { user_id: String },
}

impl CardSpec {
    pub fn card_id(&self) -> String {
        match self {
            Self::CommentActivity { user_id, post_id } => {
                format!("{user_id}:COMMENT_ACTIVITY:{post_id}")
            }
            Self::ChatActivity { user_id } => format!("{user_id}:CHAT_ACTIVITY"),
            Self::RequestedFollowers { user_id } => format!("{user_id}:REQUESTED_FOLLOWERS"),
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::CommentActivity { user_id, .. }
            | Self::ChatActivity { user_id }
            | Self::RequestedFollowers { user_id } => user_id,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::CommentActivity { .. } => "You have new comments",
            Self::ChatActivity { .. } => "You have new messages",
            Self::RequestedFollowers { .. } => "You have pending follow requests",
        }
    }

    pub fn action(&self) -> String {
        match self {
            Self::CommentActivity { post_id, .. } => format!("https://real.app/chat/post/{post_id}"),
            Self::ChatActivity { .. } | Self::RequestedFollowers { .. } => {
                "https://real.app/chat/".to_string()
            }
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::root(EntityKind::Card, &self.card_id())
    }

    fn to_record(&self, now_ms: i64) -> Record {
        let card_id = self.card_id();
        Record::new(&self.key())
            .with("cardId", card_id)
            .with("userId", self.user_id())
            .with("title", self.title())
            .with("action", self.action())
            .with("createdAt", now_ms)
            .with("gsiA1PartitionKey", format!("card/{}", self.user_id()))
            .with("gsiA1SortKey", now_ms)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Card {
    pub card_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub action: Option<String>,
    pub created_at: Option<i64>,
}

impl FromRecord for Card {
    fn from_record(record: &Record) -> DomainResult<Self> {
        Ok(Self {
            card_id: record.require_str("cardId")?,
            user_id: record.require_str("userId")?,
            title: record.get_str("title").map(ToString::to_string),
            action: record.get_str("action").map(ToString::to_string),
            created_at: record.get_i64("createdAt"),
        })
    }
}

#[derive(Clone)]
pub struct CardService {
    store: Arc<dyn EntityStore>,
}

impl CardService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Returns whether a card was created.
    pub async fn add_card_if_does_not_exist(&self, spec: &CardSpec, now_ms: i64) -> DomainResult<bool> {
        match self
            .store
            .put(&spec.to_record(now_ms), Some(&Condition::NotExists))
            .await
        {
            Ok(()) => {
                info!(card_id = %spec.card_id(), user_id = %spec.user_id(), "card added");
                Ok(true)
            }
            Err(StoreError::ConditionFailed) => {
                debug!(card_id = %spec.card_id(), "card already exists");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns whether a card was removed.
    pub async fn remove_card_if_exists(&self, spec: &CardSpec) -> DomainResult<bool> {
        match self.store.delete(&spec.key(), Some(&Condition::Exists)).await {
            Ok(_) => {
                info!(card_id = %spec.card_id(), user_id = %spec.user_id(), "card removed");
                Ok(true)
            }
            Err(StoreError::ConditionFailed) => {
                debug!(card_id = %spec.card_id(), "card already absent");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_cards(&self, user_id: &str) -> DomainResult<Vec<Card>> {
        let partition = format!("card/{user_id}");
        let mut page = PageRequest::first(CARD_PAGE_SIZE);
        let mut cards = Vec::new();
        loop {
            let result = self
                .store
                .query_index(Index::A1, &partition, &KeyRange::all(), &page)
                .await?;
            for record in &result.items {
                cards.push(Card::from_record(record)?);
            }
            match result.next_cursor {
                Some(cursor) => page = page.next(cursor),
                None => return Ok(cards),
            }
        }
    }

    pub async fn remove_user_cards(&self, user_id: &str) -> DomainResult<usize> {
        let mut removed = 0;
        for card in self.list_cards(user_id).await? {
            let key = ItemKey::root(EntityKind::Card, &card.card_id);
            match self.store.delete(&key, Some(&Condition::Exists)).await {
                Ok(_) => removed += 1,
                Err(StoreError::ConditionFailed) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

/// Keeps `cardCount` on the owning user and pushes card notifications.
pub struct CardPostProcessor {
    writer: AggregateWriter,
    notifier: Arc<dyn Notifier>,
}

impl CardPostProcessor {
    pub fn new(writer: AggregateWriter, notifier: Arc<dyn Notifier>) -> Self {
        Self { writer, notifier }
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        if diff.key.row_kind() != RowKind::Root {
            return Ok(());
        }
        let change = diff.typed::<Card>()?;
        let (card, amount, notification) = match &change {
            Change::Added(card) => (card, 1, CardChange::Added),
            Change::Deleted(card) => (card, -1, CardChange::Deleted),
            Change::Edited { .. } => return Ok(()),
        };

        let user_key = ItemKey::root(EntityKind::User, &card.user_id);
        let outcome = self
            .writer
            .apply(
                AggregateUpdate::new(user_key.clone())
                    .delta(diff.delta_id("user_card_count")?)
                    .add("cardCount", amount),
            )
            .await?;
        if amount < 0 {
            outcome.log_skipped(
                &user_key,
                &format!("Failed to decrement card count for user `{}`", card.user_id),
            );
        } else {
            outcome.log_skipped(
                &user_key,
                &format!("Failed to increment card count for user `{}`", card.user_id),
            );
        }

        self.notifier
            .card_changed(&CardNotification {
                change: notification,
                user_id: card.user_id.clone(),
                card_id: card.card_id.clone(),
                title: card.title.clone(),
                action: card.action.clone(),
            })
            .await?;
        Ok(())
    }
}

impl PostProcessor for CardPostProcessor {
    fn name(&self) -> &'static str {
        "card"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEntityStore;

    #[test]
    fn spec_ids_are_deterministic() {
        let spec = CardSpec::CommentActivity {
            user_id: "u-1".into(),
            post_id: "p-1".into(),
        };
        assert_eq!(spec.card_id(), "u-1:COMMENT_ACTIVITY:p-1");
        assert_eq!(spec.action(), "https://real.app/chat/post/p-1");
        assert_eq!(
            CardSpec::ChatActivity { user_id: "u-1".into() }.card_id(),
            "u-1:CHAT_ACTIVITY"
        );
    }

    #[tokio::test]
    async fn add_and_remove_are_idempotent() {
        let store = Arc::new(InMemoryEntityStore::new());
        let cards = CardService::new(store);
        let spec = CardSpec::RequestedFollowers { user_id: "u-1".into() };

        assert!(cards.add_card_if_does_not_exist(&spec, 10).await.unwrap());
        assert!(!cards.add_card_if_does_not_exist(&spec, 20).await.unwrap());
        assert_eq!(cards.list_cards("u-1").await.unwrap().len(), 1);

        assert!(cards.remove_card_if_exists(&spec).await.unwrap());
        assert!(!cards.remove_card_if_exists(&spec).await.unwrap());
        assert!(cards.list_cards("u-1").await.unwrap().is_empty());
    }
}
