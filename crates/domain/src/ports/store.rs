use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use super::BoxFuture;
use crate::record::{ItemKey, PARTITION_KEY, Record, SORT_KEY, compare_values};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("condition check failed")]
    ConditionFailed,
    #[error("transaction canceled (failed branch: {failed_branch:?})")]
    TransactionCanceled { failed_branch: Option<usize> },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation failed: {0}")]
    Operation(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadConsistency {
    Eventual,
    Strong,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Ge,
    Gt,
}

impl CompareOp {
    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Gt => ordering == Ordering::Greater,
        }
    }
}

/// Predicate over the current stored version of a single item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Condition {
    Exists,
    NotExists,
    AttrEquals { name: String, value: Value },
    AttrMissing(String),
    AttrCompare {
        name: String,
        op: CompareOp,
        value: Value,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn equals(name: &str, value: impl Into<Value>) -> Self {
        Self::AttrEquals {
            name: name.to_string(),
            value: value.into(),
        }
    }

    pub fn missing(name: &str) -> Self {
        Self::AttrMissing(name.to_string())
    }

    pub fn compare(name: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::AttrCompare {
            name: name.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn at_least(name: &str, value: i64) -> Self {
        Self::compare(name, CompareOp::Ge, value)
    }

    pub fn evaluate(&self, item: Option<&Record>) -> bool {
        match self {
            Self::Exists => item.is_some(),
            Self::NotExists => item.is_none(),
            Self::AttrEquals { name, value } => {
                item.and_then(|item| item.get(name)) == Some(value)
            }
            Self::AttrMissing(name) => item.is_none_or(|item| !item.contains(name)),
            Self::AttrCompare { name, op, value } => item
                .and_then(|item| item.get(name))
                .and_then(|current| compare_values(current, value))
                .is_some_and(|ordering| op.accepts(ordering)),
            Self::All(conditions) => conditions.iter().all(|c| c.evaluate(item)),
            Self::Any(conditions) => conditions.iter().any(|c| c.evaluate(item)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum AttrUpdate {
    Set(Value),
    Remove,
    /// Numeric add; a missing attribute counts as zero.
    Add(i64),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateItem {
    pub key: ItemKey,
    pub updates: Vec<(String, AttrUpdate)>,
    pub condition: Option<Condition>,
}

impl UpdateItem {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            updates: Vec::new(),
            condition: None,
        }
    }

    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.updates
            .push((name.to_string(), AttrUpdate::Set(value.into())));
        self
    }

    pub fn remove(mut self, name: &str) -> Self {
        self.updates.push((name.to_string(), AttrUpdate::Remove));
        self
    }

    pub fn add(mut self, name: &str, amount: i64) -> Self {
        self.updates.push((name.to_string(), AttrUpdate::Add(amount)));
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition.take() {
            None => condition,
            Some(Condition::All(mut existing)) => {
                existing.push(condition);
                Condition::All(existing)
            }
            Some(existing) => Condition::All(vec![existing, condition]),
        });
        self
    }

    /// The item after this update; key attributes are immutable.
    pub fn apply(&self, current: &Record) -> Result<Record, StoreError> {
        let mut next = current.clone();
        for (name, change) in &self.updates {
            if name == PARTITION_KEY || name == SORT_KEY {
                return Err(StoreError::Operation(format!(
                    "key attribute `{name}` cannot be updated"
                )));
            }
            match change {
                AttrUpdate::Set(value) => next.set(name, value.clone()),
                AttrUpdate::Remove => {
                    next.remove(name);
                }
                AttrUpdate::Add(amount) => {
                    let entry = next.entry(name);
                    let base = if entry.is_null() {
                        0
                    } else {
                        entry.as_i64().ok_or_else(|| {
                            StoreError::Operation(format!("attribute `{name}` is not an integer"))
                        })?
                    };
                    *entry = Value::from(base + amount);
                }
            }
        }
        Ok(next)
    }
}

/// One branch of a transactional write.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum WriteOp {
    Put {
        item: Record,
        condition: Option<Condition>,
    },
    Update(UpdateItem),
    Delete {
        key: ItemKey,
        condition: Option<Condition>,
    },
    ConditionCheck {
        key: ItemKey,
        condition: Condition,
    },
}

impl WriteOp {
    pub fn put_new(item: Record) -> Self {
        Self::Put {
            item,
            condition: Some(Condition::NotExists),
        }
    }

    pub fn delete_existing(key: ItemKey) -> Self {
        Self::Delete {
            key,
            condition: Some(Condition::Exists),
        }
    }

    pub fn key(&self) -> Result<ItemKey, StoreError> {
        match self {
            Self::Put { item, .. } => item
                .key()
                .ok_or_else(|| StoreError::Operation("item is missing its key attributes".into())),
            Self::Update(update) => Ok(update.key.clone()),
            Self::Delete { key, .. } | Self::ConditionCheck { key, .. } => Ok(key.clone()),
        }
    }

    /// Evaluates this branch against the stored item. `Some(next)` is the row after the
    /// write (`None` when removed); a condition check yields `None`. Updates require the
    /// item to exist.
    pub fn resolve(&self, current: Option<&Record>) -> Result<Option<Option<Record>>, StoreError> {
        let condition = match self {
            Self::Put { condition, .. } | Self::Delete { condition, .. } => condition.as_ref(),
            Self::Update(update) => update.condition.as_ref(),
            Self::ConditionCheck { condition, .. } => Some(condition),
        };
        if condition.is_some_and(|condition| !condition.evaluate(current)) {
            return Err(StoreError::ConditionFailed);
        }
        match self {
            Self::Put { item, .. } => Ok(Some(Some(item.clone()))),
            Self::Update(update) => {
                let current = current.ok_or(StoreError::ConditionFailed)?;
                Ok(Some(Some(update.apply(current)?)))
            }
            Self::Delete { .. } => Ok(Some(None)),
            Self::ConditionCheck { .. } => Ok(None),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Index {
    A1,
    A3,
    K1,
}

impl Index {
    pub fn name(&self) -> &'static str {
        match self {
            Self::A1 => "GSI-A1",
            Self::A3 => "GSI-A3",
            Self::K1 => "GSI-K1",
        }
    }

    pub fn partition_attr(&self) -> &'static str {
        match self {
            Self::A1 => "gsiA1PartitionKey",
            Self::A3 => "gsiA3PartitionKey",
            Self::K1 => "gsiK1PartitionKey",
        }
    }

    pub fn sort_attr(&self) -> &'static str {
        match self {
            Self::A1 => "gsiA1SortKey",
            Self::A3 => "gsiA3SortKey",
            Self::K1 => "gsiK1SortKey",
        }
    }
}

/// Inclusive range over index sort values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyRange {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn at_most(upper: impl Into<Value>) -> Self {
        Self {
            lower: None,
            upper: Some(upper.into()),
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        let above_lower = self.lower.as_ref().is_none_or(|lower| {
            compare_values(value, lower).is_some_and(|ordering| ordering != Ordering::Less)
        });
        let below_upper = self.upper.as_ref().is_none_or(|upper| {
            compare_values(value, upper).is_some_and(|ordering| ordering != Ordering::Greater)
        });
        above_lower && below_upper
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            cursor: None,
        }
    }

    pub fn next(&self, cursor: String) -> Self {
        Self {
            limit: self.limit,
            cursor: Some(cursor),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Record>,
    pub next_cursor: Option<String>,
}

pub trait EntityStore: Send + Sync {
    fn get(
        &self,
        key: &ItemKey,
        consistency: ReadConsistency,
    ) -> BoxFuture<'_, Result<Option<Record>, StoreError>>;

    fn put(
        &self,
        item: &Record,
        condition: Option<&Condition>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Applies an update to an existing item and returns the full new item.
    fn update(&self, update: &UpdateItem) -> BoxFuture<'_, Result<Record, StoreError>>;

    fn delete(
        &self,
        key: &ItemKey,
        condition: Option<&Condition>,
    ) -> BoxFuture<'_, Result<Option<Record>, StoreError>>;

    fn transact_write(&self, writes: &[WriteOp]) -> BoxFuture<'_, Result<(), StoreError>>;

    fn query_partition(
        &self,
        partition_key: &str,
        sort_key_prefix: Option<&str>,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>>;

    fn query_index(
        &self,
        index: Index,
        partition_key: &str,
        range: &KeyRange,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>>;

    fn scan(
        &self,
        filter: Option<&Condition>,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EntityKind, ItemKey};
    use serde_json::json;

    fn post() -> Record {
        Record::new(&ItemKey::root(EntityKind::Post, "p-1")).with("commentCount", 2)
    }

    #[test]
    fn missing_attribute_never_satisfies_comparison() {
        let post = post();
        assert!(Condition::at_least("commentCount", 2).evaluate(Some(&post)));
        assert!(!Condition::at_least("commentCount", 3).evaluate(Some(&post)));
        assert!(!Condition::at_least("commentsUnviewedCount", 0).evaluate(Some(&post)));
        assert!(!Condition::at_least("commentCount", 0).evaluate(None));
    }

    #[test]
    fn branches_resolve_against_the_stored_item() {
        let post = post();
        let key = ItemKey::root(EntityKind::Post, "p-1");
        let bump = WriteOp::Update(UpdateItem::new(key.clone()).add("commentCount", 1));
        let next = bump.resolve(Some(&post)).unwrap().unwrap().unwrap();
        assert_eq!(next.count("commentCount"), 3);
        assert_eq!(bump.resolve(None), Err(StoreError::ConditionFailed));

        assert_eq!(
            WriteOp::put_new(post.clone()).resolve(Some(&post)),
            Err(StoreError::ConditionFailed)
        );
        assert_eq!(WriteOp::delete_existing(key.clone()).resolve(Some(&post)), Ok(Some(None)));
        let check = WriteOp::ConditionCheck {
            key,
            condition: Condition::Exists,
        };
        assert_eq!(check.resolve(Some(&post)), Ok(None));
    }

    #[test]
    fn key_attributes_cannot_be_updated() {
        let update = UpdateItem::new(ItemKey::root(EntityKind::Post, "p-1")).set(SORT_KEY, "x");
        assert!(matches!(update.apply(&post()), Err(StoreError::Operation(_))));
    }

    #[test]
    fn update_builder_folds_conditions_into_all() {
        let update = UpdateItem::new(ItemKey::root(EntityKind::Post, "p-1"))
            .add("commentCount", -1)
            .when(Condition::Exists)
            .when(Condition::at_least("commentCount", 1));
        assert_eq!(
            update.condition,
            Some(Condition::All(vec![
                Condition::Exists,
                Condition::at_least("commentCount", 1)
            ]))
        );
    }

    #[test]
    fn key_range_is_inclusive() {
        let range = KeyRange::at_most(100);
        assert!(range.contains(&json!(100)));
        assert!(range.contains(&json!(-5)));
        assert!(!range.contains(&json!(101)));
        assert!(!range.contains(&json!("text")));
    }
}
