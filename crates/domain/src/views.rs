use crate::DomainResult;
use crate::ports::store::{Condition, EntityStore, PageRequest, StoreError, UpdateItem};
use crate::record::{EntityKind, ItemKey, Record};

pub const VIEW_PREFIX: &str = "view/";
const VIEW_PAGE_SIZE: usize = 100;

pub fn view_key(kind: EntityKind, entity_id: &str, user_id: &str) -> ItemKey {
    ItemKey::sub_row(kind, entity_id, format!("{VIEW_PREFIX}{user_id}"))
}

/// Records `count` views of one item by one user as a single row write.
pub async fn record_view(
    store: &dyn EntityStore,
    kind: EntityKind,
    entity_id: &str,
    user_id: &str,
    count: i64,
    viewed_at: i64,
) -> DomainResult<()> {
    let key = view_key(kind, entity_id, user_id);
    let row = Record::new(&key)
        .with("userId", user_id)
        .with("viewCount", count)
        .with("firstViewedAt", viewed_at)
        .with("lastViewedAt", viewed_at);
    match store.put(&row, Some(&Condition::NotExists)).await {
        Ok(()) => Ok(()),
        Err(StoreError::ConditionFailed) => {
            store
                .update(
                    &UpdateItem::new(key)
                        .add("viewCount", count)
                        .set("lastViewedAt", viewed_at),
                )
                .await?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Removes every view row under an entity partition.
pub async fn delete_view_rows(
    store: &dyn EntityStore,
    kind: EntityKind,
    entity_id: &str,
) -> DomainResult<usize> {
    delete_sub_rows(store, kind, entity_id, VIEW_PREFIX).await
}

/// Removes every row under an entity partition whose sort key starts with `prefix`.
pub async fn delete_sub_rows(
    store: &dyn EntityStore,
    kind: EntityKind,
    entity_id: &str,
    prefix: &str,
) -> DomainResult<usize> {
    let partition = ItemKey::root(kind, entity_id).partition_key;
    let mut deleted = 0;
    loop {
        // Deleted rows drop out of the partition, so every pass starts from the top.
        let page = store
            .query_partition(&partition, Some(prefix), &PageRequest::first(VIEW_PAGE_SIZE))
            .await?;
        let mut removed = 0;
        for row in &page.items {
            if let Some(key) = row.key() {
                if store.delete(&key, None).await?.is_some() {
                    removed += 1;
                }
            }
        }
        if removed == 0 {
            return Ok(deleted);
        }
        deleted += removed;
    }
}
