use std::str::FromStr;

use crate::DomainResult;
use crate::aggregate::{AggregateUpdate, AggregateWriter};
use crate::diff::{FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::record::{EntityKind, ItemKey, Record, RowKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowStatus {
    Following,
    Requested,
    Denied,
}

impl FromStr for FollowStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "FOLLOWING" => Ok(Self::Following),
            "REQUESTED" => Ok(Self::Requested),
            "DENIED" => Ok(Self::Denied),
            other => Err(DomainError::MalformedRecord(format!(
                "unknown follow status `{other}`"
            ))),
        }
    }
}

/// Relationship row stored under the followed user's partition.
#[derive(Clone, Debug, PartialEq)]
pub struct Follow {
    pub followed_user_id: String,
    pub follower_user_id: String,
    pub status: FollowStatus,
}

impl FromRecord for Follow {
    fn from_record(record: &Record) -> DomainResult<Self> {
        let key = record
            .key()
            .ok_or_else(|| DomainError::MalformedRecord("follow row without key".into()))?;
        let followed_user_id = key
            .entity_id()
            .ok_or_else(|| DomainError::MalformedRecord(format!("bad follow key {key}")))?
            .to_string();
        let RowKind::Follower(follower_user_id) = key.row_kind() else {
            return Err(DomainError::MalformedRecord(format!("bad follow key {key}")));
        };
        Ok(Self {
            followed_user_id,
            follower_user_id: follower_user_id.to_string(),
            status: record.require_str("followStatus")?.parse()?,
        })
    }
}

/// Adjusts follower/followed counters as follow relationships change status.
pub struct FollowPostProcessor {
    writer: AggregateWriter,
}

impl FollowPostProcessor {
    pub fn new(writer: AggregateWriter) -> Self {
        Self { writer }
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        let change = diff.typed::<Follow>()?;
        let follow = change.latest();
        let old = change.before().map(|follow| follow.status);
        let new = change.after().map(|follow| follow.status);
        let transition = |status: FollowStatus| -> i64 {
            i64::from(new == Some(status)) - i64::from(old == Some(status))
        };

        let followed_key = ItemKey::root(EntityKind::User, &follow.followed_user_id);
        let follower_key = ItemKey::root(EntityKind::User, &follow.follower_user_id);

        let following = transition(FollowStatus::Following);
        if following != 0 {
            self.adjust(diff, &follower_key, "followedCount", following, &follow.follower_user_id)
                .await?;
            self.adjust(diff, &followed_key, "followerCount", following, &follow.followed_user_id)
                .await?;
        }

        let requested = transition(FollowStatus::Requested);
        if requested != 0 {
            self.adjust(
                diff,
                &followed_key,
                "followersRequestedCount",
                requested,
                &follow.followed_user_id,
            )
            .await?;
        }
        Ok(())
    }

    async fn adjust(
        &self,
        diff: &RecordDiff,
        key: &ItemKey,
        counter: &str,
        amount: i64,
        user_id: &str,
    ) -> DomainResult<()> {
        let verb = if amount > 0 { "increment" } else { "decrement" };
        self.writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .delta(diff.delta_id(counter)?)
                    .add(counter, amount),
            )
            .await?
            .log_skipped(key, &format!("Failed to {verb} {counter} for user `{user_id}`"));
        Ok(())
    }
}

impl PostProcessor for FollowPostProcessor {
    fn name(&self) -> &'static str {
        "follow"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}
