use std::sync::Arc;

use tracing::{debug, info};

use crate::DomainResult;
use crate::aggregate::Crossing;
use crate::card::{CardService, CardSpec};
use crate::diff::{Change, FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::follow::FollowPostProcessor;
use crate::ports::BoxFuture;
use crate::ports::clients::{PushChannel, PushEndpoints, SearchIndex, UserDocument};
use crate::record::{Record, RowKind};
use crate::util::now_ms;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserStatus {
    #[default]
    Active,
    Disabled,
    Deleting,
}

impl UserStatus {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("DISABLED") => Self::Disabled,
            Some("DELETING") => Self::Deleting,
            _ => Self::Active,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub status: UserStatus,
    pub last_manually_reindexed_at: Option<i64>,
    pub followers_requested_count: i64,
    pub chats_with_unviewed_messages_count: i64,
}

impl UserProfile {
    pub fn document(&self) -> UserDocument {
        UserDocument {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            full_name: self.full_name.clone(),
        }
    }

    pub fn endpoint(&self, channel: PushChannel) -> Option<&str> {
        match channel {
            PushChannel::Email => self.email.as_deref(),
            PushChannel::Sms => self.phone_number.as_deref(),
        }
    }
}

impl FromRecord for UserProfile {
    fn from_record(record: &Record) -> DomainResult<Self> {
        let text = |name: &str| record.get_str(name).map(ToString::to_string);
        Ok(Self {
            user_id: record.require_str("userId")?,
            username: text("username"),
            full_name: text("fullName"),
            email: text(PushChannel::Email.attribute()),
            phone_number: text(PushChannel::Sms.attribute()),
            status: UserStatus::parse(record.get_str("userStatus")),
            last_manually_reindexed_at: record.get_i64("lastManuallyReindexedAt"),
            followers_requested_count: record.count("followersRequestedCount"),
            chats_with_unviewed_messages_count: record.count("chatsWithUnviewedMessagesCount"),
        })
    }
}

/// Syncs user profiles to search and push endpoints and drives user-level cards.
/// Follower rows under a user partition are delegated to the follow postprocessor.
pub struct UserPostProcessor {
    search: Arc<dyn SearchIndex>,
    push: Arc<dyn PushEndpoints>,
    cards: CardService,
    follow: Arc<FollowPostProcessor>,
}

impl UserPostProcessor {
    pub fn new(
        search: Arc<dyn SearchIndex>,
        push: Arc<dyn PushEndpoints>,
        cards: CardService,
        follow: Arc<FollowPostProcessor>,
    ) -> Self {
        Self {
            search,
            push,
            cards,
            follow,
        }
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        match diff.key.row_kind() {
            RowKind::Root => self.profile_changed(diff).await,
            RowKind::Follower(_) => self.follow.run(diff).await,
            _ => Ok(()),
        }
    }

    async fn profile_changed(&self, diff: &RecordDiff) -> DomainResult<()> {
        let change = diff.typed::<UserProfile>()?;
        self.sync_search(&change).await?;
        self.sync_push_endpoints(&change).await?;
        self.sync_cards(&change).await?;
        if let Change::Deleted(user) = &change {
            let removed = self.cards.remove_user_cards(&user.user_id).await?;
            info!(user_id = %user.user_id, removed, "user deleted; cards removed");
        }
        Ok(())
    }

    async fn sync_search(&self, change: &Change<UserProfile>) -> DomainResult<()> {
        match change {
            Change::Added(user) => self.search.add_user(&user.document()).await?,
            Change::Edited { old, new } => {
                if old.last_manually_reindexed_at != new.last_manually_reindexed_at {
                    self.search.add_user(&new.document()).await?;
                } else if old.document() != new.document() {
                    self.search.update_user(&new.document()).await?;
                }
            }
            Change::Deleted(user) => self.search.delete_user(&user.user_id).await?,
        }
        Ok(())
    }

    async fn sync_push_endpoints(&self, change: &Change<UserProfile>) -> DomainResult<()> {
        if let Change::Deleted(user) = change {
            self.push.delete_user_endpoints(&user.user_id).await?;
            return Ok(());
        }
        let user = change.latest();
        let old = change.before();

        for channel in PushChannel::all() {
            let before = old.and_then(|old| old.endpoint(channel));
            match (before, user.endpoint(channel)) {
                (before, Some(address)) if before != Some(address) => {
                    self.push
                        .update_user_endpoint(&user.user_id, channel, address)
                        .await?;
                }
                (Some(_), None) => {
                    self.push.delete_user_endpoint(&user.user_id, channel).await?;
                }
                _ => {}
            }
        }

        let old_status = old.map(|old| old.status).unwrap_or_default();
        if old_status != user.status {
            debug!(user_id = %user.user_id, ?old_status, new_status = ?user.status, "user status changed");
            match user.status {
                UserStatus::Active => self.push.enable_user_endpoints(&user.user_id).await?,
                UserStatus::Disabled => self.push.disable_user_endpoints(&user.user_id).await?,
                UserStatus::Deleting => self.push.delete_user_endpoints(&user.user_id).await?,
            }
        }
        Ok(())
    }

    async fn sync_cards(&self, change: &Change<UserProfile>) -> DomainResult<()> {
        let user_id = change.latest().user_id.clone();
        let counters: [(fn(&UserProfile) -> i64, CardSpec); 2] = [
            (
                |user| user.followers_requested_count,
                CardSpec::RequestedFollowers {
                    user_id: user_id.clone(),
                },
            ),
            (
                |user| user.chats_with_unviewed_messages_count,
                CardSpec::ChatActivity { user_id },
            ),
        ];
        for (count, spec) in counters {
            let old = change.before().map_or(0, count);
            let new = change.after().map_or(0, count);
            match Crossing::between(old, new) {
                Some(Crossing::Rose) => {
                    self.cards.add_card_if_does_not_exist(&spec, now_ms()).await?;
                }
                Some(Crossing::Fell) => {
                    self.cards.remove_card_if_exists(&spec).await?;
                }
                None => {}
            }
        }
        Ok(())
    }
}

impl PostProcessor for UserPostProcessor {
    fn name(&self) -> &'static str {
        "user"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}
