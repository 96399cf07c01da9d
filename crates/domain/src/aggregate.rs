use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::DomainResult;
use crate::ports::store::{
    Condition, EntityStore, ReadConsistency, StoreError, UpdateItem, WriteOp,
};
use crate::record::{ItemKey, Record};
use crate::util::now_ms;

/// Sort-key prefix of the marker rows that record applied deltas under their target.
pub const DELTA_PREFIX: &str = "delta/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaceReason {
    AlreadyApplied,
    TargetMissing,
    BelowFloor,
    ConditionNotMet,
    /// The companion row's condition failed; the target was left untouched.
    CompanionRejected,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    Applied,
    SkippedRace(RaceReason),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Logs a skipped race at the caller's site. Replays are expected and stay at debug.
    pub fn log_skipped(&self, target: &ItemKey, message: &str) {
        match self {
            Self::Applied => {}
            Self::SkippedRace(RaceReason::AlreadyApplied) => {
                debug!(%target, "{message}: delta already applied");
            }
            Self::SkippedRace(reason) => {
                warn!(%target, ?reason, "{message}");
            }
        }
    }
}

/// Counter crossing between two observed values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crossing {
    Rose,
    Fell,
}

impl Crossing {
    pub fn between(old: i64, new: i64) -> Option<Self> {
        match (old > 0, new > 0) {
            (false, true) => Some(Self::Rose),
            (true, false) => Some(Self::Fell),
            _ => None,
        }
    }
}

pub fn delta_marker_key(target: &ItemKey, delta_id: &str) -> ItemKey {
    ItemKey::new(target.partition_key.clone(), format!("{DELTA_PREFIX}{delta_id}"))
}

/// One conditional delta against a single aggregate row.
#[derive(Clone, Debug)]
pub struct AggregateUpdate {
    key: ItemKey,
    delta_id: Option<String>,
    adds: Vec<(String, i64)>,
    sets: Vec<(String, Value)>,
    removes: Vec<String>,
    conditions: Vec<Condition>,
    companion: Option<UpdateItem>,
}

impl AggregateUpdate {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            delta_id: None,
            adds: Vec::new(),
            sets: Vec::new(),
            removes: Vec::new(),
            conditions: Vec::new(),
            companion: None,
        }
    }

    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    /// Writes a marker row for `delta_id` next to the target in the same transaction;
    /// a second application is skipped for as long as the target's partition lives.
    pub fn delta(mut self, delta_id: impl Into<String>) -> Self {
        self.delta_id = Some(delta_id.into());
        self
    }

    pub fn add(mut self, name: &str, amount: i64) -> Self {
        self.adds.push((name.to_string(), amount));
        self
    }

    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.sets.push((name.to_string(), value.into()));
        self
    }

    pub fn remove(mut self, name: &str) -> Self {
        self.removes.push(name.to_string());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// A second row that must accept `update` for the delta to land at all.
    pub fn alongside(mut self, update: UpdateItem) -> Self {
        self.companion = Some(update);
        self
    }

    fn floors(&self) -> Vec<(String, i64)> {
        self.adds
            .iter()
            .filter(|(_, amount)| *amount < 0)
            .map(|(name, amount)| (name.clone(), -amount))
            .collect()
    }

    fn target_update(&self) -> UpdateItem {
        let mut update = UpdateItem::new(self.key.clone()).when(Condition::Exists);
        for (name, amount) in &self.adds {
            if *amount < 0 {
                update = update.when(Condition::at_least(name, -amount));
            }
            update = update.add(name, *amount);
        }
        for (name, value) in &self.sets {
            update = update.set(name, value.clone());
        }
        for name in &self.removes {
            update = update.remove(name);
        }
        for condition in &self.conditions {
            update = update.when(condition.clone());
        }
        update
    }
}

/// Applies aggregate deltas and classifies condition failures.
#[derive(Clone)]
pub struct AggregateWriter {
    store: Arc<dyn EntityStore>,
}

impl AggregateWriter {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub async fn apply(&self, update: AggregateUpdate) -> DomainResult<UpdateOutcome> {
        let target = update.target_update();
        let floors = update.floors();
        let mut writes = Vec::with_capacity(3);
        let mut marker_branch = None;
        let mut companion_branch = None;
        if let Some(delta_id) = &update.delta_id {
            let marker = Record::new(&delta_marker_key(&update.key, delta_id))
                .with("deltaId", delta_id.as_str())
                .with("appliedAt", now_ms());
            marker_branch = Some(writes.len());
            writes.push(WriteOp::put_new(marker));
        }
        if let Some(companion) = update.companion.clone() {
            companion_branch = Some(writes.len());
            writes.push(WriteOp::Update(companion));
        }
        let target_branch = writes.len();
        writes.push(WriteOp::Update(target.clone()));

        let failed_branch = if writes.len() == 1 {
            match self.store.update(&target).await {
                Ok(_) => return Ok(UpdateOutcome::Applied),
                Err(StoreError::ConditionFailed) => target_branch,
                Err(err) => return Err(err.into()),
            }
        } else {
            match self.store.transact_write(&writes).await {
                Ok(()) => return Ok(UpdateOutcome::Applied),
                Err(StoreError::TransactionCanceled {
                    failed_branch: Some(branch),
                }) => branch,
                Err(err) => return Err(err.into()),
            }
        };

        if Some(failed_branch) == marker_branch {
            return Ok(UpdateOutcome::SkippedRace(RaceReason::AlreadyApplied));
        }
        if Some(failed_branch) == companion_branch {
            return Ok(UpdateOutcome::SkippedRace(RaceReason::CompanionRejected));
        }
        let current = self.store.get(&update.key, ReadConsistency::Strong).await?;
        Ok(UpdateOutcome::SkippedRace(classify(current.as_ref(), &floors)))
    }
}

fn classify(current: Option<&Record>, floors: &[(String, i64)]) -> RaceReason {
    let Some(current) = current else {
        return RaceReason::TargetMissing;
    };
    if floors
        .iter()
        .any(|(name, magnitude)| current.count(name) < *magnitude)
    {
        return RaceReason::BelowFloor;
    }
    RaceReason::ConditionNotMet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntityKind;
    use crate::store::InMemoryEntityStore;

    async fn writer_with_post(count: i64) -> (AggregateWriter, ItemKey) {
        let store = Arc::new(InMemoryEntityStore::new());
        let key = ItemKey::root(EntityKind::Post, "p-1");
        store
            .put(&Record::new(&key).with("commentCount", count), None)
            .await
            .unwrap();
        (AggregateWriter::new(store), key)
    }

    async fn comment_count(writer: &AggregateWriter, key: &ItemKey) -> i64 {
        writer
            .store()
            .get(key, ReadConsistency::Strong)
            .await
            .unwrap()
            .unwrap()
            .count("commentCount")
    }

    #[tokio::test]
    async fn duplicate_delta_is_skipped() {
        let (writer, key) = writer_with_post(0).await;
        let first = writer
            .apply(AggregateUpdate::new(key.clone()).delta("d-1").add("commentCount", 1))
            .await
            .unwrap();
        assert!(first.is_applied());

        let second = writer
            .apply(AggregateUpdate::new(key.clone()).delta("d-1").add("commentCount", 1))
            .await
            .unwrap();
        assert_eq!(second, UpdateOutcome::SkippedRace(RaceReason::AlreadyApplied));
        assert!(
            writer
                .store()
                .get(&delta_marker_key(&key, "d-1"), ReadConsistency::Strong)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn old_delta_stays_applied_after_many_later_ones() {
        let (writer, key) = writer_with_post(0).await;
        for index in 0..300 {
            writer
                .apply(
                    AggregateUpdate::new(key.clone())
                        .delta(format!("d-{index}"))
                        .add("commentCount", 1),
                )
                .await
                .unwrap();
        }
        let replay = writer
            .apply(AggregateUpdate::new(key.clone()).delta("d-0").add("commentCount", 1))
            .await
            .unwrap();
        assert_eq!(replay, UpdateOutcome::SkippedRace(RaceReason::AlreadyApplied));
        assert_eq!(comment_count(&writer, &key).await, 300);
    }

    #[tokio::test]
    async fn rejected_delta_leaves_no_marker() {
        let (writer, key) = writer_with_post(0).await;
        let outcome = writer
            .apply(AggregateUpdate::new(key.clone()).delta("d-1").add("commentCount", -1))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::SkippedRace(RaceReason::BelowFloor));

        writer
            .apply(AggregateUpdate::new(key.clone()).add("commentCount", 1))
            .await
            .unwrap();
        let retried = writer
            .apply(AggregateUpdate::new(key.clone()).delta("d-1").add("commentCount", -1))
            .await
            .unwrap();
        assert!(retried.is_applied());
        assert_eq!(comment_count(&writer, &key).await, 0);
    }

    #[tokio::test]
    async fn decrement_never_crosses_floor() {
        let (writer, key) = writer_with_post(0).await;
        let outcome = writer
            .apply(AggregateUpdate::new(key.clone()).add("commentCount", -1))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::SkippedRace(RaceReason::BelowFloor));

        let missing = writer
            .apply(AggregateUpdate::new(ItemKey::root(EntityKind::Post, "gone")).add("commentCount", 1))
            .await
            .unwrap();
        assert_eq!(missing, UpdateOutcome::SkippedRace(RaceReason::TargetMissing));
    }

    #[tokio::test]
    async fn companion_rejection_leaves_target_untouched() {
        let (writer, key) = writer_with_post(0).await;
        let comment = ItemKey::root(EntityKind::Comment, "c-1");
        writer
            .store()
            .put(&Record::new(&comment).with("viewedByPostOwner", true), None)
            .await
            .unwrap();

        let outcome = writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .delta("d-1")
                    .add("commentCount", 1)
                    .alongside(
                        UpdateItem::new(comment)
                            .set("unviewedCounted", true)
                            .when(Condition::missing("viewedByPostOwner")),
                    ),
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::SkippedRace(RaceReason::CompanionRejected));
        assert_eq!(comment_count(&writer, &key).await, 0);
    }

    #[test]
    fn crossings_only_fire_at_zero() {
        assert_eq!(Crossing::between(0, 1), Some(Crossing::Rose));
        assert_eq!(Crossing::between(3, 0), Some(Crossing::Fell));
        assert_eq!(Crossing::between(1, 2), None);
        assert_eq!(Crossing::between(0, 0), None);
    }
}
