use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::DomainResult;
use crate::aggregate::{AggregateUpdate, AggregateWriter};
use crate::diff::{Change, FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::error::DomainError;
use crate::flag::FlagCounter;
use crate::ports::BoxFuture;
use crate::ports::store::{Condition, EntityStore, ReadConsistency, StoreError, WriteOp};
use crate::post::{Post, PostPostProcessor};
use crate::record::{EntityKind, ItemKey, Record, RowKind};
use crate::transaction::{MutationError, TransactionCoordinator};
use crate::util::collapse_counts;
use crate::views;

pub const VIEWED_BY_POST_OWNER: &str = "viewedByPostOwner";
/// Set once the comment has been added to its post's unviewed count.
pub const UNVIEWED_COUNTED: &str = "unviewedCounted";

#[derive(Clone, Debug, PartialEq)]
pub struct Comment {
    pub comment_id: String,
    pub post_id: String,
    pub user_id: String,
    pub commented_at: i64,
    pub text: Option<String>,
    pub viewed_by_post_owner: bool,
    pub unviewed_counted: bool,
}

impl Comment {
    pub fn key(&self) -> ItemKey {
        ItemKey::root(EntityKind::Comment, &self.comment_id)
    }
}

impl FromRecord for Comment {
    fn from_record(record: &Record) -> DomainResult<Self> {
        Ok(Self {
            comment_id: record.require_str("commentId")?,
            post_id: record.require_str("postId")?,
            user_id: record.require_str("userId")?,
            commented_at: record.require_i64("commentedAt")?,
            text: record.get_str("text").map(ToString::to_string),
            viewed_by_post_owner: record.get_bool(VIEWED_BY_POST_OWNER).unwrap_or(false),
            unviewed_counted: record.get_bool(UNVIEWED_COUNTED).unwrap_or(false),
        })
    }
}

async fn load_comment(store: &dyn EntityStore, comment_id: &str) -> DomainResult<Option<Comment>> {
    store
        .get(&ItemKey::root(EntityKind::Comment, comment_id), ReadConsistency::Strong)
        .await?
        .as_ref()
        .map(Comment::from_record)
        .transpose()
}

#[derive(Clone)]
pub struct CommentService {
    store: Arc<dyn EntityStore>,
    transactions: TransactionCoordinator,
}

impl CommentService {
    pub fn new(store: Arc<dyn EntityStore>, transactions: TransactionCoordinator) -> Self {
        Self {
            store,
            transactions,
        }
    }

    pub async fn get_comment(&self, comment_id: &str) -> DomainResult<Option<Comment>> {
        load_comment(self.store.as_ref(), comment_id).await
    }

    pub async fn add_comment(
        &self,
        comment_id: &str,
        post_id: &str,
        user_id: &str,
        text: &str,
        now_ms: i64,
    ) -> DomainResult<Comment> {
        let key = ItemKey::root(EntityKind::Comment, comment_id);
        let item = Record::new(&key)
            .with("commentId", comment_id)
            .with("postId", post_id)
            .with("userId", user_id)
            .with("commentedAt", now_ms)
            .with("text", text)
            .with("gsiA1PartitionKey", format!("comment/{post_id}"))
            .with("gsiA1SortKey", now_ms);
        let writes = [
            WriteOp::put_new(item),
            WriteOp::ConditionCheck {
                key: ItemKey::root(EntityKind::Post, post_id),
                condition: Condition::Exists,
            },
        ];
        let errors = [
            MutationError::new(
                EntityKind::Comment,
                format!("Unable to add comment with id `{comment_id}`... id already used?"),
            ),
            MutationError::new(
                EntityKind::Comment,
                format!("Unable to add comment to post `{post_id}`... post does not exist?"),
            ),
        ];
        let record = self
            .transactions
            .transact_and_read(&writes, &errors, &key)
            .await?;
        info!(%comment_id, %post_id, %user_id, "comment added");
        Comment::from_record(&record)
    }

    /// Only the comment's author or the post's owner may delete it.
    pub async fn delete_comment(&self, comment_id: &str, user_id: &str) -> DomainResult<Comment> {
        let comment = self
            .get_comment(comment_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let post_owner = self
            .store
            .get(&ItemKey::root(EntityKind::Post, &comment.post_id), ReadConsistency::Strong)
            .await?
            .as_ref()
            .map(Post::from_record)
            .transpose()?
            .map(|post| post.posted_by_user_id);
        if comment.user_id != user_id && post_owner.as_deref() != Some(user_id) {
            return Err(DomainError::Validation(format!(
                "User `{user_id}` is not authorized to delete comment `{comment_id}`"
            )));
        }
        match self.store.delete(&comment.key(), Some(&Condition::Exists)).await {
            Ok(_) => Ok(comment),
            Err(StoreError::ConditionFailed) => Err(DomainError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// One view-row write per distinct comment; views of one's own comments are skipped.
    pub async fn record_views(
        &self,
        comment_ids: &[String],
        user_id: &str,
        viewed_at: i64,
    ) -> DomainResult<usize> {
        let mut recorded = 0;
        for (comment_id, count) in collapse_counts(comment_ids) {
            let Some(comment) = self.get_comment(&comment_id).await? else {
                warn!(%comment_id, %user_id, "Cannot record view(s) by user `{user_id}` on DNE comment `{comment_id}`");
                continue;
            };
            if comment.user_id == user_id {
                continue;
            }
            views::record_view(
                self.store.as_ref(),
                EntityKind::Comment,
                &comment_id,
                user_id,
                count,
                viewed_at,
            )
            .await?;
            recorded += 1;
        }
        Ok(recorded)
    }
}

pub struct CommentPostProcessor {
    writer: AggregateWriter,
    post: Arc<PostPostProcessor>,
    flags: FlagCounter,
}

impl CommentPostProcessor {
    pub fn new(writer: AggregateWriter, post: Arc<PostPostProcessor>, flags: FlagCounter) -> Self {
        Self {
            writer,
            post,
            flags,
        }
    }

    fn store(&self) -> &dyn EntityStore {
        self.writer.store().as_ref()
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        match diff.key.row_kind() {
            RowKind::Root => self.comment_changed(diff).await,
            RowKind::View(user_id) if diff.old.is_none() && diff.new.is_some() => {
                self.view_added(diff, user_id).await
            }
            RowKind::Flag(_) => self.flag_changed(diff).await,
            _ => Ok(()),
        }
    }

    async fn comment_changed(&self, diff: &RecordDiff) -> DomainResult<()> {
        let change = diff.typed::<Comment>()?;
        let (comment, amount) = match &change {
            Change::Added(comment) => {
                self.post.comment_added(diff, comment).await?;
                (comment, 1)
            }
            Change::Deleted(comment) => {
                self.post.comment_deleted(diff, comment).await?;
                let removed =
                    views::delete_view_rows(self.store(), EntityKind::Comment, &comment.comment_id)
                        .await?;
                let unflagged = self.flags.clear(EntityKind::Comment, &comment.comment_id).await?;
                debug!(comment_id = %comment.comment_id, removed, unflagged, "comment sub rows deleted");
                (comment, -1)
            }
            Change::Edited { .. } => return Ok(()),
        };

        let user_key = ItemKey::root(EntityKind::User, &comment.user_id);
        let verb = if amount > 0 { "increment" } else { "decrement" };
        self.writer
            .apply(
                AggregateUpdate::new(user_key.clone())
                    .delta(diff.delta_id("user_comment_count")?)
                    .add("commentCount", amount),
            )
            .await?
            .log_skipped(
                &user_key,
                &format!("Failed to {verb} comment count for user `{}`", comment.user_id),
            );
        Ok(())
    }

    /// Comments have no viewer count, so the crowdsourced rule only looks at flags.
    async fn flag_changed(&self, diff: &RecordDiff) -> DomainResult<()> {
        let Some(flagged) = self.flags.flag_changed(diff).await? else {
            return Ok(());
        };
        let comment = Comment::from_record(&flagged.item)?;
        if !self.flags.removal_forced(&flagged, 0).await? {
            return Ok(());
        }
        warn!(
            comment_id = %comment.comment_id,
            flag_count = flagged.flag_count,
            "Force deleting comment `{}` from flagging",
            comment.comment_id
        );
        match self.store().delete(&comment.key(), Some(&Condition::Exists)).await {
            Ok(_) => Ok(()),
            Err(StoreError::ConditionFailed) => {
                debug!(comment_id = %comment.comment_id, "comment gone before forced delete");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The post owner's first view of a comment clears it from the unviewed count. The view
    /// may be routed before the comment's own add; `comment_view_added` handles both orders.
    async fn view_added(&self, diff: &RecordDiff, viewer_id: &str) -> DomainResult<()> {
        let Some(comment_id) = diff.key.entity_id() else {
            return Ok(());
        };
        let Some(comment) = load_comment(self.store(), comment_id).await? else {
            debug!(%comment_id, "view row for missing comment");
            return Ok(());
        };
        let Some(post) = self
            .store()
            .get(&ItemKey::root(EntityKind::Post, &comment.post_id), ReadConsistency::Strong)
            .await?
            .as_ref()
            .map(Post::from_record)
            .transpose()?
        else {
            return Ok(());
        };
        if viewer_id != post.posted_by_user_id
            || comment.user_id == post.posted_by_user_id
            || comment.viewed_by_post_owner
        {
            return Ok(());
        }
        self.post.comment_view_added(diff, &post, &comment).await
    }
}

impl PostProcessor for CommentPostProcessor {
    fn name(&self) -> &'static str {
        "comment"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}
