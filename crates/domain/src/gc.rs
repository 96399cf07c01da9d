use std::sync::Arc;

use tracing::{debug, info};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::store::{
    CompareOp, Condition, EntityStore, Index, KeyRange, PageRequest, ReadConsistency, StoreError,
    UpdateItem,
};
use crate::record::{EntityKind, ItemKey, Record, RowKind};
use crate::util::{format_ms_rfc3339, now_ms};

pub const DELETE_AT: &str = "deleteAt";
const K1_PARTITION: &str = "deleteAt";

/// Physically removes soft-deleted entities once their `deleteAt` has passed.
#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<dyn EntityStore>,
    page_size: usize,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn EntityStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Marks an entity for removal at `delete_at`. A marker can only be set once.
    pub async fn schedule_deletion(&self, key: &ItemKey, delete_at: i64) -> DomainResult<()> {
        let update = UpdateItem::new(key.clone())
            .set(DELETE_AT, delete_at)
            .set("gsiK1PartitionKey", K1_PARTITION)
            .set("gsiK1SortKey", delete_at)
            .when(Condition::missing(DELETE_AT));
        match self.store.update(&update).await {
            Ok(_) => {
                debug!(%key, delete_at, "deletion scheduled");
                Ok(())
            }
            Err(StoreError::ConditionFailed) => {
                match self.store.get(key, ReadConsistency::Strong).await? {
                    Some(_) => Err(DomainError::Conflict),
                    None => Err(DomainError::NotFound),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removes every entity whose `deleteAt` is at or before `cutoff` (now when absent),
    /// walking the deletion index. Returns the number of entities removed.
    pub async fn sweep(&self, cutoff: Option<i64>) -> DomainResult<usize> {
        let cutoff = cutoff.unwrap_or_else(now_ms);
        let range = KeyRange::at_most(cutoff);
        let mut page = PageRequest::first(self.page_size);
        let mut removed = 0;
        loop {
            let result = self
                .store
                .query_index(Index::K1, K1_PARTITION, &range, &page)
                .await?;
            for record in &result.items {
                if self.remove_entity(record, cutoff).await? {
                    removed += 1;
                }
            }
            match result.next_cursor {
                Some(cursor) => page = page.next(cursor),
                None => break,
            }
        }
        info!(cutoff = %format_ms_rfc3339(cutoff), removed, "garbage collection sweep finished");
        Ok(removed)
    }

    /// Full-table fallback for marked rows that never made it into the index.
    pub async fn sweep_by_scan(&self, cutoff: Option<i64>) -> DomainResult<usize> {
        let cutoff = cutoff.unwrap_or_else(now_ms);
        let filter = Condition::compare(DELETE_AT, CompareOp::Le, cutoff);
        let mut page = PageRequest::first(self.page_size);
        let mut removed = 0;
        loop {
            let result = self.store.scan(Some(&filter), &page).await?;
            for record in &result.items {
                if self.remove_entity(record, cutoff).await? {
                    removed += 1;
                }
            }
            match result.next_cursor {
                Some(cursor) => page = page.next(cursor),
                None => break,
            }
        }
        info!(cutoff = %format_ms_rfc3339(cutoff), removed, "garbage collection scan finished");
        Ok(removed)
    }

    async fn remove_entity(&self, record: &Record, cutoff: i64) -> DomainResult<bool> {
        let Some(key) = record.key() else {
            return Ok(false);
        };
        if key.row_kind() != RowKind::Root {
            return Ok(false);
        }
        // Index entries can outlive a cleared marker.
        if !record.get_i64(DELETE_AT).is_some_and(|delete_at| delete_at <= cutoff) {
            debug!(%key, "deletion marker cleared; entity kept");
            return Ok(false);
        }

        self.remove_dependents(&key).await?;
        let condition = Condition::compare(DELETE_AT, CompareOp::Le, cutoff);
        match self.store.delete(&key, Some(&condition)).await {
            Ok(Some(_)) => {
                debug!(%key, "entity removed");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(StoreError::ConditionFailed) => {
                debug!(%key, "deletion marker moved or cleared; entity kept");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Dependents go first so an interrupted sweep never leaves orphans behind.
    async fn remove_dependents(&self, key: &ItemKey) -> DomainResult<()> {
        if key.entity_kind() == Some(EntityKind::Post) {
            if let Some(post_id) = key.entity_id() {
                self.remove_post_comments(post_id).await?;
            }
        }
        self.remove_sub_rows(&key.partition_key).await
    }

    async fn remove_sub_rows(&self, partition: &str) -> DomainResult<()> {
        loop {
            let page = self
                .store
                .query_partition(partition, None, &PageRequest::first(self.page_size))
                .await?;
            let mut deleted = 0;
            for row in &page.items {
                let Some(row_key) = row.key() else { continue };
                if row_key.row_kind() == RowKind::Root {
                    continue;
                }
                if self.store.delete(&row_key, None).await?.is_some() {
                    deleted += 1;
                }
            }
            if deleted == 0 {
                return Ok(());
            }
        }
    }

    async fn remove_post_comments(&self, post_id: &str) -> DomainResult<()> {
        let partition = format!("comment/{post_id}");
        loop {
            let page = self
                .store
                .query_index(
                    Index::A1,
                    &partition,
                    &KeyRange::all(),
                    &PageRequest::first(self.page_size),
                )
                .await?;
            let mut deleted = 0;
            for comment in &page.items {
                let Some(comment_key) = comment.key() else { continue };
                self.remove_sub_rows(&comment_key.partition_key).await?;
                if self.store.delete(&comment_key, None).await?.is_some() {
                    deleted += 1;
                }
            }
            if deleted == 0 {
                return Ok(());
            }
            debug!(%post_id, deleted, "post comments removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEntityStore;

    fn collector() -> (Arc<dyn EntityStore>, GarbageCollector) {
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        (store.clone(), GarbageCollector::new(store, 2))
    }

    async fn put(store: &dyn EntityStore, record: Record) {
        store.put(&record, None).await.unwrap();
    }

    #[tokio::test]
    async fn schedule_deletion_sets_marker_once() {
        let (store, gc) = collector();
        let key = ItemKey::root(EntityKind::Album, "a-1");
        put(store.as_ref(), Record::new(&key).with("albumId", "a-1")).await;

        gc.schedule_deletion(&key, 100).await.unwrap();
        assert!(matches!(
            gc.schedule_deletion(&key, 200).await,
            Err(DomainError::Conflict)
        ));
        assert!(matches!(
            gc.schedule_deletion(&ItemKey::root(EntityKind::Album, "missing"), 1).await,
            Err(DomainError::NotFound)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_due_entities_and_their_rows() {
        let (store, gc) = collector();
        for (id, delete_at) in [("p-1", 10), ("p-2", 20), ("p-3", 30)] {
            let key = ItemKey::root(EntityKind::Post, id);
            put(store.as_ref(), Record::new(&key).with("postId", id)).await;
            put(
                store.as_ref(),
                Record::new(&ItemKey::sub_row(EntityKind::Post, id, "view/u-1")).with("userId", "u-1"),
            )
            .await;
            gc.schedule_deletion(&key, delete_at).await.unwrap();
        }
        let comment = ItemKey::root(EntityKind::Comment, "c-1");
        put(
            store.as_ref(),
            Record::new(&comment)
                .with("commentId", "c-1")
                .with("gsiA1PartitionKey", "comment/p-1")
                .with("gsiA1SortKey", 5),
        )
        .await;

        assert_eq!(gc.sweep(Some(20)).await.unwrap(), 2);
        assert_eq!(gc.sweep(Some(20)).await.unwrap(), 0);

        let strong = ReadConsistency::Strong;
        assert!(store.get(&comment, strong).await.unwrap().is_none());
        assert!(
            store
                .get(&ItemKey::sub_row(EntityKind::Post, "p-1", "view/u-1"), strong)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get(&ItemKey::root(EntityKind::Post, "p-3"), strong)
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(gc.sweep(Some(30)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_fallback_finds_rows_missing_from_index() {
        let (store, gc) = collector();
        let key = ItemKey::root(EntityKind::Chat, "c-1");
        put(
            store.as_ref(),
            Record::new(&key).with("chatId", "c-1").with(DELETE_AT, 5),
        )
        .await;

        assert_eq!(gc.sweep(Some(10)).await.unwrap(), 0);
        assert_eq!(gc.sweep_by_scan(Some(10)).await.unwrap(), 1);
        assert!(store.get(&key, ReadConsistency::Strong).await.unwrap().is_none());
    }
}
