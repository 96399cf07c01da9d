use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::aggregate::{AggregateUpdate, AggregateWriter, RaceReason, UpdateOutcome};
use crate::diff::RecordDiff;
use crate::error::DomainError;
use crate::ports::store::{Condition, EntityStore, ReadConsistency, StoreError, WriteOp};
use crate::record::{EntityKind, ItemKey, Record, RowKind};
use crate::transaction::{MutationError, TransactionCoordinator};
use crate::views;

pub const FLAG_PREFIX: &str = "flag/";
pub const FLAG_COUNT: &str = "flagCount";

pub fn flag_key(kind: EntityKind, item_id: &str, user_id: &str) -> ItemKey {
    ItemKey::sub_row(kind, item_id, format!("{FLAG_PREFIX}{user_id}"))
}

fn owner_attr(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Post => Some("postedByUserId"),
        EntityKind::Comment | EntityKind::ChatMessage => Some("userId"),
        _ => None,
    }
}

/// When a flag forces an item out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagPolicy {
    /// A single flag from any of these users is enough.
    pub admin_usernames: Vec<String>,
    pub min_flags: i64,
    /// Flags needed as a percentage of the item's distinct viewers.
    pub viewer_ratio_pct: i64,
}

impl Default for FlagPolicy {
    fn default() -> Self {
        Self {
            admin_usernames: vec!["real".to_string(), "ian".to_string()],
            min_flags: 3,
            viewer_ratio_pct: 10,
        }
    }
}

impl FlagPolicy {
    pub fn is_admin(&self, username: &str) -> bool {
        self.admin_usernames.iter().any(|admin| admin == username)
    }

    pub fn crowdsourced_removal(&self, flag_count: i64, viewed_by_count: i64) -> bool {
        flag_count >= self.min_flags
            && flag_count.saturating_mul(100) >= viewed_by_count.saturating_mul(self.viewer_ratio_pct)
    }
}

/// Writes and removes `flag/<userId>` rows. Counters follow from the row diffs.
#[derive(Clone)]
pub struct FlagService {
    store: Arc<dyn EntityStore>,
    transactions: TransactionCoordinator,
}

impl FlagService {
    pub fn new(store: Arc<dyn EntityStore>, transactions: TransactionCoordinator) -> Self {
        Self {
            store,
            transactions,
        }
    }

    async fn load_owned(
        &self,
        kind: EntityKind,
        item_id: &str,
    ) -> DomainResult<(Record, &'static str)> {
        let Some(owner_attr) = owner_attr(kind) else {
            return Err(DomainError::Validation(format!("{kind} items cannot be flagged")));
        };
        let item = self
            .store
            .get(&ItemKey::root(kind, item_id), ReadConsistency::Strong)
            .await?
            .ok_or(DomainError::NotFound)?;
        Ok((item, owner_attr))
    }

    pub async fn flag(
        &self,
        kind: EntityKind,
        item_id: &str,
        user_id: &str,
        now_ms: i64,
    ) -> DomainResult<()> {
        let (item, owner_attr) = self.load_owned(kind, item_id).await?;
        if item.get_str(owner_attr) == Some(user_id) {
            return Err(DomainError::Validation(format!(
                "User cannot flag their own {kind} `{item_id}`"
            )));
        }
        let key = flag_key(kind, item_id, user_id);
        let row = Record::new(&key)
            .with("userId", user_id)
            .with("createdAt", now_ms);
        let writes = [
            WriteOp::put_new(row),
            WriteOp::ConditionCheck {
                key: ItemKey::root(kind, item_id),
                condition: Condition::Exists,
            },
        ];
        let errors = [
            MutationError::new(
                kind,
                format!("User `{user_id}` has already flagged {kind} `{item_id}`"),
            ),
            MutationError::new(kind, format!("{kind} `{item_id}` does not exist")),
        ];
        self.transactions.transact_and_read(&writes, &errors, &key).await?;
        info!(%kind, %item_id, %user_id, "item flagged");
        Ok(())
    }

    pub async fn unflag(&self, kind: EntityKind, item_id: &str, user_id: &str) -> DomainResult<()> {
        self.load_owned(kind, item_id).await?;
        match self
            .store
            .delete(&flag_key(kind, item_id, user_id), Some(&Condition::Exists))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::ConditionFailed) => Err(MutationError::new(
                kind,
                format!("User `{user_id}` has not flagged {kind} `{item_id}`"),
            )
            .into()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A flag that was counted against its item.
#[derive(Clone, Debug)]
pub struct Flagged {
    pub user_id: String,
    pub flag_count: i64,
    pub item: Record,
}

/// Keeps `flagCount` on the flagged item in step with its flag rows.
#[derive(Clone)]
pub struct FlagCounter {
    writer: AggregateWriter,
    policy: FlagPolicy,
}

impl FlagCounter {
    pub fn new(writer: AggregateWriter, policy: FlagPolicy) -> Self {
        Self { writer, policy }
    }

    pub fn policy(&self) -> &FlagPolicy {
        &self.policy
    }

    fn store(&self) -> &dyn EntityStore {
        self.writer.store().as_ref()
    }

    /// Removes every flag row of a deleted item.
    pub async fn clear(&self, kind: EntityKind, item_id: &str) -> DomainResult<usize> {
        views::delete_sub_rows(self.store(), kind, item_id, FLAG_PREFIX).await
    }

    /// Returns the counted flag when `diff` added one; deletions only decrement.
    pub async fn flag_changed(&self, diff: &RecordDiff) -> DomainResult<Option<Flagged>> {
        let RowKind::Flag(user_id) = diff.key.row_kind() else {
            return Ok(None);
        };
        let item_key = diff.key.root_key();
        match (&diff.old, &diff.new) {
            (None, Some(_)) => {
                let outcome = self
                    .writer
                    .apply(
                        AggregateUpdate::new(item_key.clone())
                            .delta(diff.delta_id("flag_count")?)
                            .add(FLAG_COUNT, 1),
                    )
                    .await?;
                // A redelivered flag re-checks removal; the forced writes are conditional.
                let counted = outcome.is_applied()
                    || outcome == UpdateOutcome::SkippedRace(RaceReason::AlreadyApplied);
                if !counted {
                    outcome.log_skipped(
                        &item_key,
                        &format!("Failed to increment flag count for {item_key}"),
                    );
                    return Ok(None);
                }
                let Some(item) = self.store().get(&item_key, ReadConsistency::Strong).await? else {
                    return Ok(None);
                };
                Ok(Some(Flagged {
                    user_id: user_id.to_string(),
                    flag_count: item.count(FLAG_COUNT),
                    item,
                }))
            }
            (Some(_), None) => {
                let outcome = self
                    .writer
                    .apply(
                        AggregateUpdate::new(item_key.clone())
                            .delta(diff.delta_id("flag_count")?)
                            .add(FLAG_COUNT, -1),
                    )
                    .await?;
                if outcome == UpdateOutcome::SkippedRace(RaceReason::TargetMissing) {
                    debug!(%item_key, "flag removed from deleted item");
                } else {
                    outcome.log_skipped(
                        &item_key,
                        &format!("Failed to decrement flag count for {item_key}"),
                    );
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Admin flaggers force removal outright; otherwise the crowdsourced rule decides.
    pub async fn removal_forced(
        &self,
        flagged: &Flagged,
        viewed_by_count: i64,
    ) -> DomainResult<bool> {
        let username = self
            .store()
            .get(&ItemKey::root(EntityKind::User, &flagged.user_id), ReadConsistency::Strong)
            .await?
            .and_then(|user| user.get_str("username").map(ToString::to_string));
        if username.as_deref().is_some_and(|name| self.policy.is_admin(name)) {
            return Ok(true);
        }
        if username.is_none() {
            warn!(user_id = %flagged.user_id, "flag by unknown user");
        }
        Ok(self
            .policy
            .crowdsourced_removal(flagged.flag_count, viewed_by_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admins_and_crowds_force_removal() {
        let policy = FlagPolicy::default();
        assert!(policy.is_admin("real"));
        assert!(!policy.is_admin("oscar"));

        assert!(!policy.crowdsourced_removal(2, 0));
        assert!(policy.crowdsourced_removal(3, 0));
        assert!(policy.crowdsourced_removal(3, 30));
        assert!(!policy.crowdsourced_removal(3, 31));
        assert!(policy.crowdsourced_removal(10, 100));
    }

    #[test]
    fn flag_rows_decode_as_flags() {
        let key = flag_key(EntityKind::Post, "p-1", "u-1");
        assert_eq!(key.row_kind(), RowKind::Flag("u-1"));
        assert_eq!(key.entity_id(), Some("p-1"));
    }
}
