use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DomainResult;
use crate::error::DomainError;

pub const PARTITION_KEY: &str = "partitionKey";
pub const SORT_KEY: &str = "sortKey";
pub const ROOT_SORT_KEY: &str = "-";
pub const PROFILE_SORT_KEY: &str = "profile";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Post,
    Comment,
    Chat,
    ChatMessage,
    Album,
    Card,
}

impl EntityKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Chat => "chat",
            Self::ChatMessage => "chatMessage",
            Self::Album => "album",
            Self::Card => "card",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Chat => "chat",
            Self::ChatMessage => "chat_message",
            Self::Album => "album",
            Self::Card => "card",
        }
    }

    /// Sort key of the row that holds the entity itself.
    pub fn root_sort_key(&self) -> &'static str {
        match self {
            Self::User => PROFILE_SORT_KEY,
            _ => ROOT_SORT_KEY,
        }
    }
}

impl FromStr for EntityKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "post" => Ok(Self::Post),
            "comment" => Ok(Self::Comment),
            "chat" => Ok(Self::Chat),
            "chatMessage" => Ok(Self::ChatMessage),
            "album" => Ok(Self::Album),
            "card" => Ok(Self::Card),
            _ => Err("unknown entity prefix"),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a row under an entity partition represents, decoded from its sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKind<'a> {
    Root,
    Member(&'a str),
    View(&'a str),
    Follower(&'a str),
    Flag(&'a str),
    Other(&'a str),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl ItemKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }

    pub fn root(kind: EntityKind, entity_id: &str) -> Self {
        Self::new(
            format!("{}/{entity_id}", kind.prefix()),
            kind.root_sort_key(),
        )
    }

    pub fn sub_row(kind: EntityKind, entity_id: &str, sort_key: impl Into<String>) -> Self {
        Self::new(format!("{}/{entity_id}", kind.prefix()), sort_key)
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        let (prefix, _) = self.partition_key.split_once('/')?;
        prefix.parse().ok()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.partition_key
            .split_once('/')
            .map(|(_, id)| id)
            .filter(|id| !id.is_empty())
    }

    /// The root row of the entity this row belongs to.
    pub fn root_key(&self) -> ItemKey {
        let sort_key = self
            .entity_kind()
            .map_or(ROOT_SORT_KEY, |kind| kind.root_sort_key());
        Self::new(self.partition_key.clone(), sort_key)
    }

    pub fn row_kind(&self) -> RowKind<'_> {
        let sort_key = self.sort_key.as_str();
        if sort_key == ROOT_SORT_KEY || sort_key == PROFILE_SORT_KEY {
            return RowKind::Root;
        }
        match sort_key.split_once('/') {
            Some(("member", user_id)) => RowKind::Member(user_id),
            Some(("view", user_id)) => RowKind::View(user_id),
            Some(("follower", user_id)) => RowKind::Follower(user_id),
            Some(("flag", user_id)) => RowKind::Flag(user_id),
            _ => RowKind::Other(sort_key),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.partition_key, self.sort_key)
    }
}

/// One schemaless row of the shared table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new(key: &ItemKey) -> Self {
        Self::default()
            .with(PARTITION_KEY, key.partition_key.clone())
            .with(SORT_KEY, key.sort_key.clone())
    }

    pub fn from_value(value: Value) -> DomainResult<Self> {
        serde_json::from_value(value)
            .map_err(|err| DomainError::MalformedRecord(format!("record is not a map: {err}")))
    }

    pub fn key(&self) -> Option<ItemKey> {
        Some(ItemKey::new(
            self.get_str(PARTITION_KEY)?,
            self.get_str(SORT_KEY)?,
        ))
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if value.is_null() {
            self.0.remove(name);
        } else {
            self.0.insert(name.to_string(), value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// Counter value, absent counters read as zero.
    pub fn count(&self, name: &str) -> i64 {
        self.get_i64(name).unwrap_or(0)
    }

    pub fn get_string_list(&self, name: &str) -> Vec<String> {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn require_str(&self, name: &str) -> DomainResult<String> {
        self.get_str(name)
            .map(ToString::to_string)
            .ok_or_else(|| DomainError::MalformedRecord(format!("missing string attribute `{name}`")))
    }

    pub fn require_i64(&self, name: &str) -> DomainResult<i64> {
        self.get_i64(name)
            .ok_or_else(|| DomainError::MalformedRecord(format!("missing numeric attribute `{name}`")))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub(crate) fn entry(&mut self, name: &str) -> &mut Value {
        self.0.entry(name.to_string()).or_insert(Value::Null)
    }
}

/// Ordering used by index ranges and comparison conditions: numbers compare numerically,
/// strings lexicographically, and numbers sort before strings.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(_), Value::String(_)) => Some(Ordering::Less),
        (Value::String(_), Value::Number(_)) => Some(Ordering::Greater),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_key_decodes_entity_kind_and_id() {
        let key = ItemKey::new("chatMessage/m-1", "-");
        assert_eq!(key.entity_kind(), Some(EntityKind::ChatMessage));
        assert_eq!(key.entity_id(), Some("m-1"));
        assert_eq!(key.row_kind(), RowKind::Root);

        let key = ItemKey::new("unknown/x", "-");
        assert_eq!(key.entity_kind(), None);
    }

    #[test]
    fn row_kind_reads_sub_row_prefixes() {
        assert_eq!(
            ItemKey::new("chat/c-1", "member/u-1").row_kind(),
            RowKind::Member("u-1")
        );
        assert_eq!(
            ItemKey::new("comment/c-1", "view/u-2").row_kind(),
            RowKind::View("u-2")
        );
        assert_eq!(
            ItemKey::new("user/u-1", "follower/u-3").row_kind(),
            RowKind::Follower("u-3")
        );
        assert_eq!(ItemKey::new("user/u-1", "profile").row_kind(), RowKind::Root);
        assert_eq!(
            ItemKey::new("post/p-1", "flag/u-1").row_kind(),
            RowKind::Flag("u-1")
        );
        assert_eq!(
            ItemKey::new("post/p-1", "delta/abc").row_kind(),
            RowKind::Other("delta/abc")
        );
        assert_eq!(
            ItemKey::new("user/u-1", "follower/u-3").root_key(),
            ItemKey::root(EntityKind::User, "u-1")
        );
    }

    #[test]
    fn record_carries_its_key_and_drops_nulls() {
        let key = ItemKey::root(EntityKind::Post, "p-1");
        let mut record = Record::new(&key).with("commentCount", 3);
        assert_eq!(record.key(), Some(key));
        assert_eq!(record.count("commentCount"), 3);
        assert_eq!(record.count("commentsUnviewedCount"), 0);

        record.set("commentCount", Value::Null);
        assert!(!record.contains("commentCount"));
    }

    #[test]
    fn compare_values_orders_numbers_before_strings() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!(5), &json!("a")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(null), &json!(1)), None);
    }
}
