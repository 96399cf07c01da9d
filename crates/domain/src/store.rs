use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::diff::RecordDiff;
use crate::ports::BoxFuture;
use crate::ports::store::{
    Condition, EntityStore, Index, KeyRange, Page, PageRequest, ReadConsistency, StoreError,
    UpdateItem, WriteOp,
};
use crate::record::{ItemKey, Record, compare_values};

type Rows = BTreeMap<ItemKey, Record>;

/// Single-process table with the same conditional semantics as the shared store.
/// Every committed change can be published to an in-process mutation stream.
#[derive(Clone, Default)]
pub struct InMemoryEntityStore {
    inner: Arc<Mutex<Rows>>,
    stream: Option<mpsc::UnboundedSender<RecordDiff>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store plus the receiving end of its mutation stream, in commit order.
    pub fn with_stream() -> (Self, mpsc::UnboundedReceiver<RecordDiff>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let store = Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
            stream: Some(sender),
        };
        (store, receiver)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Rows>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("entity store lock poisoned".into()))
    }

    fn publish(&self, diff: RecordDiff) {
        if let Some(sender) = &self.stream {
            if sender.send(diff).is_err() {
                debug!("mutation stream receiver dropped; diff discarded");
            }
        }
    }

    /// Resolves and commits a single write, publishing its diff.
    fn write_one(&self, write: WriteOp) -> Result<Option<RecordDiff>, StoreError> {
        let key = write.key()?;
        let mut rows = self.lock()?;
        let Some(next) = write.resolve(rows.get(&key))? else {
            return Ok(None);
        };
        let diff = Self::commit(&mut rows, key, next);
        if let Some(diff) = &diff {
            self.publish(diff.clone());
        }
        Ok(diff)
    }

    /// Commits one row change and returns the diff it produced, if any.
    fn commit(rows: &mut Rows, key: ItemKey, new: Option<Record>) -> Option<RecordDiff> {
        let old = match &new {
            Some(record) => rows.insert(key.clone(), record.clone()),
            None => rows.remove(&key),
        };
        if old.is_none() && new.is_none() {
            return None;
        }
        Some(RecordDiff::new(key, old, new))
    }
}

fn encode_cursor<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Operation(err.to_string()))
}

fn decode_cursor<T: serde::de::DeserializeOwned>(cursor: &str) -> Result<T, StoreError> {
    serde_json::from_str(cursor)
        .map_err(|err| StoreError::Operation(format!("invalid page cursor: {err}")))
}

fn index_order(left: &(Value, ItemKey), right: &(Value, ItemKey)) -> Ordering {
    compare_values(&left.0, &right.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| left.1.cmp(&right.1))
}

impl EntityStore for InMemoryEntityStore {
    fn get(
        &self,
        key: &ItemKey,
        _consistency: ReadConsistency,
    ) -> BoxFuture<'_, Result<Option<Record>, StoreError>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.lock()?.get(&key).cloned()) })
    }

    fn put(
        &self,
        item: &Record,
        condition: Option<&Condition>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let item = item.clone();
        let condition = condition.cloned();
        Box::pin(async move {
            self.write_one(WriteOp::Put { item, condition })?;
            Ok(())
        })
    }

    fn update(&self, update: &UpdateItem) -> BoxFuture<'_, Result<Record, StoreError>> {
        let update = update.clone();
        Box::pin(async move {
            self.write_one(WriteOp::Update(update))?
                .and_then(|diff| diff.new)
                .ok_or_else(|| StoreError::Operation("update produced no item".into()))
        })
    }

    fn delete(
        &self,
        key: &ItemKey,
        condition: Option<&Condition>,
    ) -> BoxFuture<'_, Result<Option<Record>, StoreError>> {
        let key = key.clone();
        let condition = condition.cloned();
        Box::pin(async move {
            Ok(self
                .write_one(WriteOp::Delete { key, condition })?
                .and_then(|diff| diff.old))
        })
    }

    fn transact_write(&self, writes: &[WriteOp]) -> BoxFuture<'_, Result<(), StoreError>> {
        let writes = writes.to_vec();
        Box::pin(async move {
            let mut rows = self.lock()?;

            let mut seen = HashSet::new();
            let mut planned = Vec::with_capacity(writes.len());
            for (branch, write) in writes.iter().enumerate() {
                let key = write.key()?;
                if !seen.insert(key.clone()) {
                    return Err(StoreError::Operation(format!(
                        "transaction touches {key} more than once"
                    )));
                }
                match write.resolve(rows.get(&key)) {
                    Ok(Some(next)) => planned.push((key, next)),
                    Ok(None) => {}
                    Err(StoreError::ConditionFailed) => {
                        return Err(StoreError::TransactionCanceled {
                            failed_branch: Some(branch),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }

            let diffs: Vec<RecordDiff> = planned
                .into_iter()
                .filter_map(|(key, next)| Self::commit(&mut rows, key, next))
                .collect();
            for diff in diffs {
                self.publish(diff);
            }
            Ok(())
        })
    }

    fn query_partition(
        &self,
        partition_key: &str,
        sort_key_prefix: Option<&str>,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        let partition_key = partition_key.to_string();
        let sort_key_prefix = sort_key_prefix.map(ToString::to_string);
        let page = page.clone();
        Box::pin(async move {
            let after: Option<ItemKey> = page.cursor.as_deref().map(decode_cursor).transpose()?;
            let rows = self.lock()?;
            let start = ItemKey::new(partition_key.clone(), String::new());
            let mut matched = rows
                .range(start..)
                .take_while(|(key, _)| key.partition_key == partition_key)
                .filter(|(key, _)| after.as_ref().is_none_or(|after| *key > after))
                .filter(|(key, _)| {
                    sort_key_prefix
                        .as_deref()
                        .is_none_or(|prefix| key.sort_key.starts_with(prefix))
                });

            let items: Vec<(ItemKey, Record)> = matched
                .by_ref()
                .take(page.limit)
                .map(|(key, record)| (key.clone(), record.clone()))
                .collect();
            let has_more = matched.next().is_some();
            let next_cursor = match items.last() {
                Some((key, _)) if has_more => Some(encode_cursor(key)?),
                _ => None,
            };
            Ok(Page {
                items: items.into_iter().map(|(_, record)| record).collect(),
                next_cursor,
            })
        })
    }

    fn query_index(
        &self,
        index: Index,
        partition_key: &str,
        range: &KeyRange,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        let partition_key = partition_key.to_string();
        let range = range.clone();
        let page = page.clone();
        Box::pin(async move {
            let after: Option<(Value, ItemKey)> =
                page.cursor.as_deref().map(decode_cursor).transpose()?;
            let rows = self.lock()?;
            let mut matched: Vec<((Value, ItemKey), &Record)> = rows
                .iter()
                .filter(|(_, record)| {
                    record.get_str(index.partition_attr()) == Some(partition_key.as_str())
                })
                .filter_map(|(key, record)| {
                    let sort_value = record.get(index.sort_attr())?.clone();
                    range
                        .contains(&sort_value)
                        .then(|| ((sort_value, key.clone()), record))
                })
                .filter(|(position, _)| {
                    after
                        .as_ref()
                        .is_none_or(|after| index_order(position, after) == Ordering::Greater)
                })
                .collect();
            matched.sort_by(|left, right| index_order(&left.0, &right.0));

            let has_more = matched.len() > page.limit;
            matched.truncate(page.limit);
            let next_cursor = match matched.last() {
                Some((position, _)) if has_more => Some(encode_cursor(position)?),
                _ => None,
            };
            Ok(Page {
                items: matched
                    .into_iter()
                    .map(|(_, record)| record.clone())
                    .collect(),
                next_cursor,
            })
        })
    }

    fn scan(
        &self,
        filter: Option<&Condition>,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        let filter = filter.cloned();
        let page = page.clone();
        Box::pin(async move {
            let after: Option<ItemKey> = page.cursor.as_deref().map(decode_cursor).transpose()?;
            let rows = self.lock()?;
            // The limit bounds rows examined, not rows returned.
            let mut remaining = rows
                .iter()
                .filter(|(key, _)| after.as_ref().is_none_or(|after| *key > after));
            let examined: Vec<(&ItemKey, &Record)> = remaining.by_ref().take(page.limit).collect();
            let has_more = remaining.next().is_some();
            let next_cursor = match examined.last() {
                Some((key, _)) if has_more => Some(encode_cursor(key)?),
                _ => None,
            };
            let items = examined
                .into_iter()
                .filter(|(_, record)| filter.as_ref().is_none_or(|f| f.evaluate(Some(*record))))
                .map(|(_, record)| record.clone())
                .collect();
            Ok(Page { items, next_cursor })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::store::CompareOp;
    use crate::record::EntityKind;
    use serde_json::json;

    fn post(id: &str) -> Record {
        Record::new(&ItemKey::root(EntityKind::Post, id)).with("postId", id)
    }

    #[tokio::test]
    async fn conditional_put_rejects_existing_item() {
        let store = InMemoryEntityStore::new();
        store.put(&post("p-1"), Some(&Condition::NotExists)).await.unwrap();
        let err = store
            .put(&post("p-1"), Some(&Condition::NotExists))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ConditionFailed);
    }

    #[tokio::test]
    async fn update_requires_existing_item_and_returns_new_image() {
        let store = InMemoryEntityStore::new();
        let key = ItemKey::root(EntityKind::Post, "p-1");
        let err = store
            .update(&UpdateItem::new(key.clone()).add("commentCount", 1))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ConditionFailed);

        store.put(&post("p-1"), None).await.unwrap();
        let updated = store
            .update(
                &UpdateItem::new(key)
                    .add("commentCount", 2)
                    .set("text", "edited"),
            )
            .await
            .unwrap();
        assert_eq!(updated.count("commentCount"), 2);
        assert_eq!(updated.get_str("text"), Some("edited"));
    }

    #[tokio::test]
    async fn transaction_reports_failed_branch_and_applies_nothing() {
        let store = InMemoryEntityStore::new();
        store.put(&post("p-1"), None).await.unwrap();
        let user_key = ItemKey::root(EntityKind::User, "u-1");
        store.put(&Record::new(&user_key), None).await.unwrap();

        let err = store
            .transact_write(&[
                WriteOp::Update(UpdateItem::new(user_key.clone()).add("postCount", 1)),
                WriteOp::put_new(post("p-1")),
            ])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::TransactionCanceled {
                failed_branch: Some(1)
            }
        );
        let user = store
            .get(&user_key, ReadConsistency::Strong)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.count("postCount"), 0);
    }

    #[tokio::test]
    async fn committed_changes_are_published_in_order() {
        let (store, mut stream) = InMemoryEntityStore::with_stream();
        let key = ItemKey::root(EntityKind::Post, "p-1");
        store.put(&post("p-1"), None).await.unwrap();
        store
            .update(&UpdateItem::new(key.clone()).set("text", "hello"))
            .await
            .unwrap();
        store.delete(&key, None).await.unwrap();
        store.delete(&key, None).await.unwrap();

        let ops: Vec<_> = std::iter::from_fn(|| stream.try_recv().ok())
            .map(|diff| diff.op())
            .collect();
        assert_eq!(
            ops,
            vec![
                Some(crate::diff::DiffOp::Add),
                Some(crate::diff::DiffOp::Edit),
                Some(crate::diff::DiffOp::Delete)
            ]
        );
    }

    #[tokio::test]
    async fn index_query_pages_in_sort_order() {
        let store = InMemoryEntityStore::new();
        for (id, delete_at) in [("p-1", 30), ("p-2", 10), ("p-3", 20), ("p-4", 99)] {
            store
                .put(
                    &post(id)
                        .with("gsiK1PartitionKey", "deleteAt")
                        .with("gsiK1SortKey", delete_at),
                    None,
                )
                .await
                .unwrap();
        }

        let range = KeyRange::at_most(30);
        let first = store
            .query_index(Index::K1, "deleteAt", &range, &PageRequest::first(2))
            .await
            .unwrap();
        let ids: Vec<_> = first.items.iter().filter_map(|r| r.get_str("postId")).collect();
        assert_eq!(ids, vec!["p-2", "p-3"]);

        let cursor = first.next_cursor.clone().unwrap();
        let second = store
            .query_index(
                Index::K1,
                "deleteAt",
                &range,
                &PageRequest::first(2).next(cursor),
            )
            .await
            .unwrap();
        let ids: Vec<_> = second.items.iter().filter_map(|r| r.get_str("postId")).collect();
        assert_eq!(ids, vec!["p-1"]);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn partition_query_filters_by_sort_prefix() {
        let store = InMemoryEntityStore::new();
        store
            .put(&Record::new(&ItemKey::root(EntityKind::Chat, "c-1")), None)
            .await
            .unwrap();
        for user in ["u-1", "u-2"] {
            let key = ItemKey::sub_row(EntityKind::Chat, "c-1", format!("member/{user}"));
            store.put(&Record::new(&key), None).await.unwrap();
        }
        let page = store
            .query_partition("chat/c-1", Some("member/"), &PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn scan_filters_examined_rows() {
        let store = InMemoryEntityStore::new();
        store
            .put(&post("p-1").with("deleteAt", json!(5)), None)
            .await
            .unwrap();
        store.put(&post("p-2"), None).await.unwrap();
        let filter = Condition::compare("deleteAt", CompareOp::Le, 10);
        let page = store
            .scan(Some(&filter), &PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }
}
