use std::sync::Arc;

use tracing::{debug, warn};

use crate::DomainResult;
use crate::aggregate::{AggregateUpdate, AggregateWriter, Crossing, RaceReason, UpdateOutcome};
use crate::card::{CardService, CardSpec};
use crate::comment::{Comment, UNVIEWED_COUNTED, VIEWED_BY_POST_OWNER};
use crate::diff::{Change, FromRecord, RecordDiff};
use crate::dispatch::PostProcessor;
use crate::error::DomainError;
use crate::flag::FlagCounter;
use crate::ports::BoxFuture;
use crate::ports::store::{
    Condition, EntityStore, Index, KeyRange, PageRequest, ReadConsistency, StoreError, UpdateItem,
};
use crate::record::{EntityKind, ItemKey, Record, RowKind};
use crate::transaction::MutationError;
use crate::util::{collapse_counts, now_ms};
use crate::views;

pub const COMMENT_COUNT: &str = "commentCount";
pub const COMMENTS_UNVIEWED_COUNT: &str = "commentsUnviewedCount";
pub const LAST_UNVIEWED_COMMENT_ID: &str = "lastUnviewedCommentId";
pub const LAST_UNVIEWED_COMMENT_BY_USER_ID: &str = "lastUnviewedCommentByUserId";
pub const LAST_UNVIEWED_COMMENT_AT: &str = "lastUnviewedCommentAt";
pub const POST_STATUS: &str = "postStatus";
pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_ARCHIVED: &str = "ARCHIVED";

const POINTER_ATTRS: [&str; 5] = [
    LAST_UNVIEWED_COMMENT_ID,
    LAST_UNVIEWED_COMMENT_BY_USER_ID,
    LAST_UNVIEWED_COMMENT_AT,
    "gsiA3PartitionKey",
    "gsiA3SortKey",
];
const COMMENT_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct Post {
    pub post_id: String,
    pub posted_by_user_id: String,
    pub posted_at: Option<i64>,
    pub archived: bool,
    pub comment_count: i64,
    pub comments_unviewed_count: i64,
    pub viewed_by_count: i64,
    pub last_unviewed_comment_id: Option<String>,
}

impl Post {
    pub fn key(&self) -> ItemKey {
        ItemKey::root(EntityKind::Post, &self.post_id)
    }
}

impl FromRecord for Post {
    fn from_record(record: &Record) -> DomainResult<Self> {
        Ok(Self {
            post_id: record.require_str("postId")?,
            posted_by_user_id: record.require_str("postedByUserId")?,
            posted_at: record.get_i64("postedAt"),
            archived: record.get_str(POST_STATUS) == Some(STATUS_ARCHIVED),
            comment_count: record.count(COMMENT_COUNT),
            comments_unviewed_count: record.count(COMMENTS_UNVIEWED_COUNT),
            viewed_by_count: record.count("viewedByCount"),
            last_unviewed_comment_id: record
                .get_str(LAST_UNVIEWED_COMMENT_ID)
                .map(ToString::to_string),
        })
    }
}

fn archivable() -> Condition {
    Condition::All(vec![
        Condition::Exists,
        Condition::Any(vec![
            Condition::missing(POST_STATUS),
            Condition::equals(POST_STATUS, STATUS_COMPLETED),
        ]),
    ])
}

async fn load_post(store: &dyn EntityStore, post_id: &str) -> DomainResult<Option<Post>> {
    store
        .get(&ItemKey::root(EntityKind::Post, post_id), ReadConsistency::Strong)
        .await?
        .as_ref()
        .map(Post::from_record)
        .transpose()
}

#[derive(Clone)]
pub struct PostService {
    store: Arc<dyn EntityStore>,
}

impl PostService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn get_post(&self, post_id: &str) -> DomainResult<Option<Post>> {
        load_post(self.store.as_ref(), post_id).await
    }

    /// Owner counters are maintained by the post postprocessor.
    pub async fn add_post(
        &self,
        post_id: &str,
        posted_by_user_id: &str,
        text: Option<&str>,
        now_ms: i64,
    ) -> DomainResult<Post> {
        let key = ItemKey::root(EntityKind::Post, post_id);
        let mut item = Record::new(&key)
            .with("postId", post_id)
            .with("postedByUserId", posted_by_user_id)
            .with("postedAt", now_ms)
            .with(POST_STATUS, STATUS_COMPLETED);
        if let Some(text) = text {
            item.set("text", text);
        }
        match self.store.put(&item, Some(&Condition::NotExists)).await {
            Ok(()) => {}
            Err(StoreError::ConditionFailed) => {
                return Err(MutationError::new(
                    EntityKind::Post,
                    format!("Unable to add post with id `{post_id}`... id already used?"),
                )
                .into());
            }
            Err(err) => return Err(err.into()),
        }
        self.get_post(post_id).await?.ok_or(DomainError::NotFound)
    }

    /// Only completed posts can be archived; the owner's post count drops once the
    /// archive diff is routed.
    pub async fn archive_post(&self, post_id: &str) -> DomainResult<Post> {
        let update = UpdateItem::new(ItemKey::root(EntityKind::Post, post_id))
            .set(POST_STATUS, STATUS_ARCHIVED)
            .when(archivable());
        match self.store.update(&update).await {
            Ok(record) => Post::from_record(&record),
            Err(StoreError::ConditionFailed) => {
                let post = self.get_post(post_id).await?.ok_or(DomainError::NotFound)?;
                Err(MutationError::new(
                    EntityKind::Post,
                    format!("Cannot archive post `{}` with status `{STATUS_ARCHIVED}`", post.post_id),
                )
                .into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Records one view row per distinct post; views of one's own posts are skipped.
    pub async fn record_views(
        &self,
        post_ids: &[String],
        user_id: &str,
        viewed_at: i64,
    ) -> DomainResult<usize> {
        let mut recorded = 0;
        for (post_id, count) in collapse_counts(post_ids) {
            let Some(post) = self.get_post(&post_id).await? else {
                warn!(%post_id, %user_id, "Cannot record view(s) by user `{user_id}` on DNE post `{post_id}`");
                continue;
            };
            if post.posted_by_user_id == user_id {
                continue;
            }
            views::record_view(
                self.store.as_ref(),
                EntityKind::Post,
                &post_id,
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

/// Maintains post aggregates: owner post count, comment counters, the unviewed-comment
/// pointer and the comment activity card.
pub struct PostPostProcessor {
    writer: AggregateWriter,
    cards: CardService,
    flags: FlagCounter,
}

impl PostPostProcessor {
    pub fn new(writer: AggregateWriter, cards: CardService, flags: FlagCounter) -> Self {
        Self {
            writer,
            cards,
            flags,
        }
    }

    fn store(&self) -> &dyn EntityStore {
        self.writer.store().as_ref()
    }

    async fn handle(&self, diff: &RecordDiff) -> DomainResult<()> {
        match diff.key.row_kind() {
            RowKind::Root => self.post_changed(diff).await,
            RowKind::View(user_id) => self.view_changed(diff, user_id).await,
            RowKind::Flag(_) => self.flag_changed(diff).await,
            _ => Ok(()),
        }
    }

    async fn post_changed(&self, diff: &RecordDiff) -> DomainResult<()> {
        let change = diff.typed::<Post>()?;
        let post = change.latest();
        let owner_key = ItemKey::root(EntityKind::User, &post.posted_by_user_id);
        let card = CardSpec::CommentActivity {
            user_id: post.posted_by_user_id.clone(),
            post_id: post.post_id.clone(),
        };

        match &change {
            Change::Added(_) => {
                self.writer
                    .apply(
                        AggregateUpdate::new(owner_key.clone())
                            .delta(diff.delta_id("user_post_count")?)
                            .add("postCount", 1),
                    )
                    .await?
                    .log_skipped(
                        &owner_key,
                        &format!("Failed to increment post count for user `{}`", post.posted_by_user_id),
                    );
            }
            Change::Deleted(old) => {
                // Archiving already took the post out of the owner's count.
                if !old.archived {
                    self.decrement_post_count(diff, post).await?;
                }
                self.cards.remove_card_if_exists(&card).await?;
                return Ok(());
            }
            Change::Edited { old, new } => {
                if !old.archived && new.archived {
                    self.decrement_post_count(diff, post).await?;
                }
            }
        }

        let old_count = change.before().map_or(0, |post| post.comments_unviewed_count);
        let new_count = change.after().map_or(0, |post| post.comments_unviewed_count);
        match Crossing::between(old_count, new_count) {
            Some(Crossing::Rose) => {
                self.cards.add_card_if_does_not_exist(&card, now_ms()).await?;
            }
            Some(Crossing::Fell) => {
                self.cards.remove_card_if_exists(&card).await?;
            }
            None => {}
        }
        Ok(())
    }

    async fn decrement_post_count(&self, diff: &RecordDiff, post: &Post) -> DomainResult<()> {
        let owner_key = ItemKey::root(EntityKind::User, &post.posted_by_user_id);
        self.writer
            .apply(
                AggregateUpdate::new(owner_key.clone())
                    .delta(diff.delta_id("user_post_count")?)
                    .add("postCount", -1),
            )
            .await?
            .log_skipped(
                &owner_key,
                &format!("Failed to decrement post count for user `{}`", post.posted_by_user_id),
            );
        Ok(())
    }

    async fn flag_changed(&self, diff: &RecordDiff) -> DomainResult<()> {
        let Some(flagged) = self.flags.flag_changed(diff).await? else {
            return Ok(());
        };
        let post = Post::from_record(&flagged.item)?;
        if post.archived || !self.flags.removal_forced(&flagged, post.viewed_by_count).await? {
            return Ok(());
        }
        warn!(
            post_id = %post.post_id,
            flag_count = flagged.flag_count,
            "Force archiving post `{}` from flagging",
            post.post_id
        );
        let outcome = self
            .writer
            .apply(
                AggregateUpdate::new(post.key())
                    .set(POST_STATUS, STATUS_ARCHIVED)
                    .when(archivable()),
            )
            .await?;
        if !outcome.is_applied() {
            debug!(post_id = %post.post_id, "post archived or gone before forced archive");
        }
        Ok(())
    }

    async fn view_changed(&self, diff: &RecordDiff, viewer_id: &str) -> DomainResult<()> {
        if diff.old.is_some() || diff.new.is_none() {
            return Ok(());
        }
        let Some(post_id) = diff.key.entity_id() else {
            return Ok(());
        };
        let Some(post) = load_post(self.store(), post_id).await? else {
            debug!(%post_id, "view row for missing post");
            return Ok(());
        };
        if post.posted_by_user_id == viewer_id {
            return Ok(());
        }
        let key = post.key();
        self.writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .delta(diff.delta_id("post_viewed_by_count")?)
                    .add("viewedByCount", 1),
            )
            .await?
            .log_skipped(&key, &format!("Failed to increment viewed by count for post `{post_id}`"));
        Ok(())
    }

    /// Comments by anyone but the post owner are counted unviewed, unless the owner's view
    /// already reached the comment row first.
    pub async fn comment_added(&self, diff: &RecordDiff, comment: &Comment) -> DomainResult<()> {
        let Some(post) = load_post(self.store(), &comment.post_id).await? else {
            warn!(post_id = %comment.post_id, comment_id = %comment.comment_id, "comment added to missing post");
            return Ok(());
        };
        let key = post.key();
        let failure = format!("Failed to increment comment count for post `{}`", post.post_id);
        if comment.user_id == post.posted_by_user_id {
            self.writer
                .apply(
                    AggregateUpdate::new(key.clone())
                        .delta(diff.delta_id("post_comment_added")?)
                        .add(COMMENT_COUNT, 1),
                )
                .await?
                .log_skipped(&key, &failure);
            return Ok(());
        }

        let counted = AggregateUpdate::new(key.clone())
            .delta(diff.delta_id("post_comment_added")?)
            .add(COMMENT_COUNT, 1)
            .add(COMMENTS_UNVIEWED_COUNT, 1)
            .set(LAST_UNVIEWED_COMMENT_ID, comment.comment_id.as_str())
            .set(LAST_UNVIEWED_COMMENT_BY_USER_ID, comment.user_id.as_str())
            .set(LAST_UNVIEWED_COMMENT_AT, comment.commented_at)
            .set("gsiA3PartitionKey", format!("post/{}", post.posted_by_user_id))
            .set("gsiA3SortKey", comment.commented_at)
            .alongside(
                UpdateItem::new(comment.key())
                    .set(UNVIEWED_COUNTED, true)
                    .when(Condition::missing(VIEWED_BY_POST_OWNER)),
            );
        let outcome = self.writer.apply(counted).await?;
        if outcome != UpdateOutcome::SkippedRace(RaceReason::CompanionRejected) {
            outcome.log_skipped(&key, &failure);
            return Ok(());
        }

        debug!(comment_id = %comment.comment_id, post_id = %post.post_id, "comment viewed or gone before it was counted");
        self.writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .delta(diff.delta_id("post_comment_added_viewed")?)
                    .add(COMMENT_COUNT, 1),
            )
            .await?
            .log_skipped(&key, &failure);
        Ok(())
    }

    /// The two decrements are independent; each logs its own race.
    pub async fn comment_deleted(&self, diff: &RecordDiff, comment: &Comment) -> DomainResult<()> {
        let Some(post) = load_post(self.store(), &comment.post_id).await? else {
            debug!(post_id = %comment.post_id, comment_id = %comment.comment_id, "comment deleted from missing post");
            return Ok(());
        };
        let key = post.key();

        self.writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .delta(diff.delta_id("post_comment_count_decrement")?)
                    .add(COMMENT_COUNT, -1),
            )
            .await?
            .log_skipped(
                &key,
                &format!("Failed to decrement comment count for post `{}`", post.post_id),
            );

        if comment.unviewed_counted && !comment.viewed_by_post_owner {
            self.writer
                .apply(
                    AggregateUpdate::new(key.clone())
                        .delta(diff.delta_id("post_comments_unviewed_decrement")?)
                        .add(COMMENTS_UNVIEWED_COUNT, -1),
                )
                .await?
                .log_skipped(
                    &key,
                    &format!("Failed to decrement comments unviewed count for post `{}`", post.post_id),
                );
        }

        self.repoint_unviewed(&post, &comment.comment_id).await
    }

    /// Marks the comment viewed. The unviewed count only drops if the comment was counted;
    /// otherwise the mark alone keeps a later add from counting it.
    pub async fn comment_view_added(
        &self,
        diff: &RecordDiff,
        post: &Post,
        comment: &Comment,
    ) -> DomainResult<()> {
        let key = post.key();
        let outcome = self
            .writer
            .apply(
                AggregateUpdate::new(key.clone())
                    .delta(diff.delta_id("post_comment_viewed")?)
                    .add(COMMENTS_UNVIEWED_COUNT, -1)
                    .alongside(
                        UpdateItem::new(comment.key())
                            .set(VIEWED_BY_POST_OWNER, true)
                            .when(Condition::equals(UNVIEWED_COUNTED, true))
                            .when(Condition::missing(VIEWED_BY_POST_OWNER)),
                    ),
            )
            .await?;
        match outcome {
            UpdateOutcome::Applied => {}
            UpdateOutcome::SkippedRace(RaceReason::AlreadyApplied) => return Ok(()),
            UpdateOutcome::SkippedRace(reason) => {
                if reason != RaceReason::CompanionRejected {
                    outcome.log_skipped(
                        &key,
                        &format!("Failed to decrement comments unviewed count for post `{}`", post.post_id),
                    );
                }
                let marked = self
                    .writer
                    .apply(
                        AggregateUpdate::new(comment.key())
                            .set(VIEWED_BY_POST_OWNER, true)
                            .when(Condition::missing(VIEWED_BY_POST_OWNER)),
                    )
                    .await?;
                if !marked.is_applied() {
                    debug!(comment_id = %comment.comment_id, "comment already marked viewed by post owner");
                }
                return Ok(());
            }
        }

        let Some(current) = load_post(self.store(), &post.post_id).await? else {
            return Ok(());
        };
        if current.comments_unviewed_count > 0 {
            return self.repoint_unviewed(&current, &comment.comment_id).await;
        }
        if current.last_unviewed_comment_id.is_none() {
            return Ok(());
        }
        let mut clear = AggregateUpdate::new(key.clone()).when(Condition::equals(COMMENTS_UNVIEWED_COUNT, 0));
        for name in POINTER_ATTRS {
            clear = clear.remove(name);
        }
        if !self.writer.apply(clear).await?.is_applied() {
            debug!(post_id = %post.post_id, "unviewed comments arrived before pointer was cleared");
        }
        Ok(())
    }

    /// Moves the pointer off `gone_comment_id` to the newest remaining unviewed comment,
    /// only while it still references that comment.
    async fn repoint_unviewed(&self, post: &Post, gone_comment_id: &str) -> DomainResult<()> {
        if post.last_unviewed_comment_id.as_deref() != Some(gone_comment_id) {
            return Ok(());
        }
        let key = post.key();
        let mut update = AggregateUpdate::new(key.clone())
            .when(Condition::equals(LAST_UNVIEWED_COMMENT_ID, gone_comment_id));
        match self.latest_unviewed_comment(post, gone_comment_id).await? {
            Some(comment) => {
                update = update
                    .set(LAST_UNVIEWED_COMMENT_ID, comment.comment_id.as_str())
                    .set(LAST_UNVIEWED_COMMENT_BY_USER_ID, comment.user_id.as_str())
                    .set(LAST_UNVIEWED_COMMENT_AT, comment.commented_at)
                    .set("gsiA3PartitionKey", format!("post/{}", post.posted_by_user_id))
                    .set("gsiA3SortKey", comment.commented_at);
            }
            None => {
                for name in POINTER_ATTRS {
                    update = update.remove(name);
                }
            }
        }
        if !self.writer.apply(update).await?.is_applied() {
            debug!(post_id = %post.post_id, comment_id = %gone_comment_id, "unviewed comment pointer already advanced");
        }
        Ok(())
    }

    async fn latest_unviewed_comment(
        &self,
        post: &Post,
        excluding: &str,
    ) -> DomainResult<Option<Comment>> {
        let partition = format!("comment/{}", post.post_id);
        let mut page = PageRequest::first(COMMENT_PAGE_SIZE);
        let mut latest: Option<Comment> = None;
        loop {
            let result = self
                .store()
                .query_index(Index::A1, &partition, &KeyRange::all(), &page)
                .await?;
            for record in &result.items {
                let comment = Comment::from_record(record)?;
                let unviewed = comment.comment_id != excluding
                    && comment.unviewed_counted
                    && !comment.viewed_by_post_owner;
                if unviewed
                    && latest
                        .as_ref()
                        .is_none_or(|latest| comment.commented_at > latest.commented_at)
                {
                    latest = Some(comment);
                }
            }
            match result.next_cursor {
                Some(cursor) => page = page.next(cursor),
                None => return Ok(latest),
            }
        }
    }
}

impl PostProcessor for PostPostProcessor {
    fn name(&self) -> &'static str {
        "post"
    }

    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>> {
        Box::pin(self.handle(diff))
    }
}
