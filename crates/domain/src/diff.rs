use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::error::DomainError;
use crate::record::{ItemKey, Record};
use crate::util::content_hash;

/// Length of the hex prefix kept from a delta hash.
const DELTA_ID_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffOp {
    Add,
    Edit,
    Delete,
}

impl DiffOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

/// One mutation as seen by the stream: the row key with its before and after images.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordDiff {
    pub key: ItemKey,
    pub old: Option<Record>,
    pub new: Option<Record>,
}

impl RecordDiff {
    pub fn new(key: ItemKey, old: Option<Record>, new: Option<Record>) -> Self {
        Self { key, old, new }
    }

    /// `None` when both images are absent.
    pub fn op(&self) -> Option<DiffOp> {
        match (&self.old, &self.new) {
            (None, Some(_)) => Some(DiffOp::Add),
            (Some(_), Some(_)) => Some(DiffOp::Edit),
            (Some(_), None) => Some(DiffOp::Delete),
            (None, None) => None,
        }
    }

    pub fn typed<T: FromRecord>(&self) -> DomainResult<Change<T>> {
        match (&self.old, &self.new) {
            (None, Some(new)) => Ok(Change::Added(T::from_record(new)?)),
            (Some(old), Some(new)) => Ok(Change::Edited {
                old: T::from_record(old)?,
                new: T::from_record(new)?,
            }),
            (Some(old), None) => Ok(Change::Deleted(T::from_record(old)?)),
            (None, None) => Err(DomainError::MalformedRecord(format!(
                "diff for {} carries neither image",
                self.key
            ))),
        }
    }

    /// Deterministic id for a delta derived from this diff; `label` separates the
    /// different deltas one diff can produce.
    pub fn delta_id(&self, label: &str) -> DomainResult<String> {
        let digest = content_hash(&(
            &self.key.partition_key,
            &self.key.sort_key,
            &self.old,
            &self.new,
            label,
        ))?;
        Ok(digest[..DELTA_ID_LEN].to_string())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    Added(T),
    Edited { old: T, new: T },
    Deleted(T),
}

impl<T> Change<T> {
    pub fn before(&self) -> Option<&T> {
        match self {
            Self::Added(_) => None,
            Self::Edited { old, .. } | Self::Deleted(old) => Some(old),
        }
    }

    pub fn after(&self) -> Option<&T> {
        match self {
            Self::Added(new) | Self::Edited { new, .. } => Some(new),
            Self::Deleted(_) => None,
        }
    }

    /// Whichever image is the most recent.
    pub fn latest(&self) -> &T {
        match self {
            Self::Added(item) | Self::Deleted(item) | Self::Edited { new: item, .. } => item,
        }
    }
}

/// Parses a raw row image into a typed entity view.
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> DomainResult<Self>;
}
