use std::sync::Arc;

use tracing::info;

use crate::DomainResult;
use crate::diff::FromRecord;
use crate::error::DomainError;
use crate::ports::store::{Condition, EntityStore, ReadConsistency, UpdateItem, WriteOp};
use crate::record::{EntityKind, ItemKey, Record};
use crate::transaction::{MutationError, TransactionCoordinator};

#[derive(Clone, Debug, PartialEq)]
pub struct Album {
    pub album_id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: i64,
}

impl FromRecord for Album {
    fn from_record(record: &Record) -> DomainResult<Self> {
        Ok(Self {
            album_id: record.require_str("albumId")?,
            owner_id: record.require_str("ownerId")?,
            name: record.require_str("name")?,
            created_at: record.require_i64("createdAt")?,
        })
    }
}

#[derive(Clone)]
pub struct AlbumService {
    store: Arc<dyn EntityStore>,
    transactions: TransactionCoordinator,
}

impl AlbumService {
    pub fn new(store: Arc<dyn EntityStore>, transactions: TransactionCoordinator) -> Self {
        Self {
            store,
            transactions,
        }
    }

    pub async fn get_album(&self, album_id: &str) -> DomainResult<Option<Album>> {
        self.store
            .get(&ItemKey::root(EntityKind::Album, album_id), ReadConsistency::Strong)
            .await?
            .as_ref()
            .map(Album::from_record)
            .transpose()
    }

    pub async fn add_album(
        &self,
        album_id: &str,
        owner_id: &str,
        name: &str,
        now_ms: i64,
    ) -> DomainResult<Album> {
        let key = ItemKey::root(EntityKind::Album, album_id);
        let item = Record::new(&key)
            .with("albumId", album_id)
            .with("ownerId", owner_id)
            .with("name", name)
            .with("createdAt", now_ms)
            .with("gsiA1PartitionKey", format!("album/{owner_id}"))
            .with("gsiA1SortKey", now_ms);
        let writes = [
            WriteOp::put_new(item),
            WriteOp::Update(
                UpdateItem::new(ItemKey::root(EntityKind::User, owner_id))
                    .add("albumCount", 1)
                    .when(Condition::Exists),
            ),
        ];
        let errors = [
            MutationError::new(
                EntityKind::Album,
                format!("Unable to add album with id `{album_id}`... id already used?"),
            ),
            MutationError::new(
                EntityKind::Album,
                format!("Unable to increment User.albumCount for user `{owner_id}`"),
            ),
        ];
        let record = self
            .transactions
            .transact_and_read(&writes, &errors, &key)
            .await?;
        info!(%album_id, %owner_id, "album added");
        Album::from_record(&record)
    }

    pub async fn delete_album(&self, album_id: &str) -> DomainResult<Album> {
        let album = self
            .get_album(album_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let writes = [
            WriteOp::delete_existing(ItemKey::root(EntityKind::Album, album_id)),
            WriteOp::Update(
                UpdateItem::new(ItemKey::root(EntityKind::User, &album.owner_id))
                    .add("albumCount", -1)
                    .when(Condition::Exists)
                    .when(Condition::at_least("albumCount", 1)),
            ),
        ];
        let errors = [
            MutationError::new(
                EntityKind::Album,
                format!("Unable to delete album `{album_id}`... album does not exist?"),
            ),
            MutationError::new(
                EntityKind::Album,
                format!("Unable to decrement User.albumCount for user `{}`", album.owner_id),
            ),
        ];
        self.transactions.transact_write(&writes, &errors).await?;
        info!(%album_id, owner_id = %album.owner_id, "album deleted");
        Ok(album)
    }
}
