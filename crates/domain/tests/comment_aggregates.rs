mod common;

use common::Harness;
use ripple_domain::card::CardSpec;
use ripple_domain::error::DomainError;
use ripple_domain::post::{
    COMMENT_COUNT, COMMENTS_UNVIEWED_COUNT, LAST_UNVIEWED_COMMENT_AT,
    LAST_UNVIEWED_COMMENT_BY_USER_ID, LAST_UNVIEWED_COMMENT_ID,
};
use ripple_domain::record::{EntityKind, ItemKey};

async fn harness_with_post() -> Harness {
    let mut harness = Harness::new();
    harness.add_user("owner", "olivia").await;
    harness.add_user("other", "oscar").await;
    harness
        .core
        .posts
        .add_post("p-1", "owner", Some("hello"), 1_000)
        .await
        .unwrap();
    harness.settle().await;
    harness
}

fn comment_card() -> ItemKey {
    CardSpec::CommentActivity {
        user_id: "owner".into(),
        post_id: "p-1".into(),
    }
    .key()
}

#[tokio::test]
async fn counters_and_pointer_follow_comment_lifecycle() {
    let mut h = harness_with_post().await;
    assert_eq!(h.count(EntityKind::User, "owner", "postCount").await, 1);

    h.core
        .comments
        .add_comment("c-1", "p-1", "owner", "first", 2_000)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.count(EntityKind::Post, "p-1", COMMENT_COUNT).await, 1);
    assert_eq!(h.count(EntityKind::Post, "p-1", COMMENTS_UNVIEWED_COUNT).await, 0);
    assert!(h.get(&comment_card()).await.is_none());

    h.core
        .comments
        .add_comment("c-2", "p-1", "other", "second", 3_000)
        .await
        .unwrap();
    h.settle().await;
    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENT_COUNT), 2);
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 1);
    assert_eq!(post.get_str(LAST_UNVIEWED_COMMENT_ID), Some("c-2"));
    assert_eq!(post.get_str(LAST_UNVIEWED_COMMENT_BY_USER_ID), Some("other"));
    assert_eq!(post.get_i64(LAST_UNVIEWED_COMMENT_AT), Some(3_000));
    assert_eq!(post.get_str("gsiA3PartitionKey"), Some("post/owner"));
    assert!(h.get(&comment_card()).await.is_some());
    assert_eq!(h.count(EntityKind::User, "owner", "cardCount").await, 1);

    h.core.comments.delete_comment("c-1", "owner").await.unwrap();
    h.settle().await;
    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENT_COUNT), 1);
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 1);
    assert_eq!(post.get_str(LAST_UNVIEWED_COMMENT_ID), Some("c-2"));

    h.core.comments.delete_comment("c-2", "other").await.unwrap();
    h.settle().await;
    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENT_COUNT), 0);
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 0);
    assert!(post.get(LAST_UNVIEWED_COMMENT_ID).is_none());
    assert!(post.get("gsiA3SortKey").is_none());
    assert!(h.get(&comment_card()).await.is_none());
    assert_eq!(h.count(EntityKind::User, "owner", "cardCount").await, 0);
    assert_eq!(h.count(EntityKind::User, "other", "commentCount").await, 0);
}

#[tokio::test]
async fn redelivered_diffs_do_not_double_count() {
    let mut h = harness_with_post().await;
    h.core
        .comments
        .add_comment("c-1", "p-1", "other", "hi", 2_000)
        .await
        .unwrap();
    let delivered = h.settle().await;

    h.redeliver(&delivered).await;
    h.redeliver(&delivered).await;

    assert_eq!(h.count(EntityKind::Post, "p-1", COMMENT_COUNT).await, 1);
    assert_eq!(h.count(EntityKind::Post, "p-1", COMMENTS_UNVIEWED_COUNT).await, 1);
    assert_eq!(h.count(EntityKind::User, "other", "commentCount").await, 1);
    assert_eq!(h.count(EntityKind::User, "owner", "cardCount").await, 1);
}

#[tokio::test]
async fn deleting_newest_unviewed_comment_moves_pointer_back() {
    let mut h = harness_with_post().await;
    for (id, at) in [("c-1", 2_000), ("c-2", 3_000)] {
        h.core
            .comments
            .add_comment(id, "p-1", "other", "hey", at)
            .await
            .unwrap();
    }
    h.settle().await;
    assert_eq!(
        h.root(EntityKind::Post, "p-1").await.get_str(LAST_UNVIEWED_COMMENT_ID),
        Some("c-2")
    );

    h.core.comments.delete_comment("c-1", "other").await.unwrap();
    h.settle().await;
    assert_eq!(
        h.root(EntityKind::Post, "p-1").await.get_str(LAST_UNVIEWED_COMMENT_ID),
        Some("c-2")
    );

    h.core
        .comments
        .add_comment("c-3", "p-1", "other", "again", 4_000)
        .await
        .unwrap();
    h.settle().await;
    h.core.comments.delete_comment("c-3", "owner").await.unwrap();
    h.settle().await;
    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.get_str(LAST_UNVIEWED_COMMENT_ID), Some("c-2"));
    assert_eq!(post.get_i64(LAST_UNVIEWED_COMMENT_AT), Some(3_000));
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 1);
}

#[tokio::test]
async fn owner_view_clears_unviewed_state() {
    let mut h = harness_with_post().await;
    h.core
        .comments
        .add_comment("c-1", "p-1", "other", "hi", 2_000)
        .await
        .unwrap();
    h.settle().await;

    let recorded = h
        .core
        .comments
        .record_views(&["c-1".to_string(), "c-1".to_string()], "owner", 5_000)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(recorded, 1);

    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 0);
    assert!(post.get(LAST_UNVIEWED_COMMENT_ID).is_none());
    assert!(h.get(&comment_card()).await.is_none());
    let comment = h.root(EntityKind::Comment, "c-1").await;
    assert_eq!(comment.get_bool("viewedByPostOwner"), Some(true));
    let view = h
        .get(&ItemKey::sub_row(EntityKind::Comment, "c-1", "view/owner"))
        .await
        .unwrap();
    assert_eq!(view.count("viewCount"), 2);

    // A viewed comment no longer counts as unviewed when it goes away.
    h.core.comments.delete_comment("c-1", "other").await.unwrap();
    h.settle().await;
    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENT_COUNT), 0);
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 0);
    assert!(
        h.get(&ItemKey::sub_row(EntityKind::Comment, "c-1", "view/owner"))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn owner_view_routed_before_comment_add_is_not_counted() {
    let mut h = harness_with_post().await;
    h.core
        .comments
        .add_comment("c-1", "p-1", "other", "hi", 2_000)
        .await
        .unwrap();
    h.core
        .comments
        .record_views(&["c-1".to_string()], "owner", 2_500)
        .await
        .unwrap();
    let pending = h.take_pending();
    let (views, rest): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|diff| diff.key.sort_key.starts_with("view/"));
    assert_eq!(views.len(), 1);
    h.redeliver(&views).await;
    h.redeliver(&rest).await;

    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENT_COUNT), 1);
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 0);
    assert!(post.get(LAST_UNVIEWED_COMMENT_ID).is_none());
    assert!(h.get(&comment_card()).await.is_none());
    let comment = h.root(EntityKind::Comment, "c-1").await;
    assert_eq!(comment.get_bool("viewedByPostOwner"), Some(true));
    assert!(comment.get("unviewedCounted").is_none());

    h.core.comments.delete_comment("c-1", "other").await.unwrap();
    h.settle().await;
    let post = h.root(EntityKind::Post, "p-1").await;
    assert_eq!(post.count(COMMENT_COUNT), 0);
    assert_eq!(post.count(COMMENTS_UNVIEWED_COUNT), 0);
}

#[tokio::test]
async fn post_views_collapse_per_post() {
    let mut h = harness_with_post().await;
    let ids = ["p-1", "p-1", "missing"].map(String::from);
    let recorded = h.core.posts.record_views(&ids, "other", 2_000).await.unwrap();
    h.settle().await;
    assert_eq!(recorded, 1);

    let view = h
        .get(&ItemKey::sub_row(EntityKind::Post, "p-1", "view/other"))
        .await
        .unwrap();
    assert_eq!(view.count("viewCount"), 2);
    assert_eq!(h.count(EntityKind::Post, "p-1", "viewedByCount").await, 1);

    h.core.posts.record_views(&ids[..1], "other", 3_000).await.unwrap();
    h.core.posts.record_views(&ids[..1], "owner", 3_000).await.unwrap();
    h.settle().await;
    assert_eq!(h.count(EntityKind::Post, "p-1", "viewedByCount").await, 1);
}

#[tokio::test]
async fn comment_on_missing_post_reports_cause() {
    let h = harness_with_post().await;
    let err = h
        .core
        .comments
        .add_comment("c-1", "nope", "other", "hi", 2_000)
        .await
        .unwrap_err();
    match err {
        DomainError::Mutation(err) => assert_eq!(
            err.message,
            "Unable to add comment to post `nope`... post does not exist?"
        ),
        other => panic!("unexpected error {other:?}"),
    }

    let err = h
        .core
        .posts
        .add_post("p-1", "owner", None, 3_000)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Mutation(_)));
}

#[tokio::test]
async fn only_author_or_post_owner_may_delete() {
    let mut h = harness_with_post().await;
    h.add_user("third", "tess").await;
    h.core
        .comments
        .add_comment("c-1", "p-1", "other", "hi", 2_000)
        .await
        .unwrap();
    h.settle().await;

    let err = h.core.comments.delete_comment("c-1", "third").await.unwrap_err();
    assert!(matches!(err, DomainError::Validation(_)));
    assert!(h.core.comments.get_comment("c-1").await.unwrap().is_some());
}
