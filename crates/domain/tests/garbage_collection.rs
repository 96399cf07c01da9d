mod common;

use common::Harness;
use ripple_domain::ports::store::UpdateItem;
use ripple_domain::record::{EntityKind, ItemKey};

async fn harness_with_posts(delete_ats: &[(&str, i64)]) -> Harness {
    let mut h = Harness::new();
    h.add_user("owner", "olivia").await;
    h.add_user("other", "oscar").await;
    for (post_id, delete_at) in delete_ats {
        h.core.posts.add_post(post_id, "owner", None, 1_000).await.unwrap();
        h.core
            .comments
            .add_comment(&format!("{post_id}-c"), post_id, "other", "hi", 1_500)
            .await
            .unwrap();
        h.core
            .gc
            .schedule_deletion(&ItemKey::root(EntityKind::Post, post_id), *delete_at)
            .await
            .unwrap();
    }
    h.settle().await;
    h.core
        .posts
        .record_views(&["p-1".to_string()], "other", 1_800)
        .await
        .unwrap();
    h.settle().await;
    h
}

#[tokio::test]
async fn sweep_removes_posts_with_comments_and_views() {
    let mut h = harness_with_posts(&[("p-1", 2_000), ("p-2", 3_000), ("p-3", 9_000)]).await;

    assert_eq!(h.core.gc.sweep(Some(3_000)).await.unwrap(), 2);
    h.settle().await;

    assert!(h.core.posts.get_post("p-1").await.unwrap().is_none());
    assert!(h.core.comments.get_comment("p-1-c").await.unwrap().is_none());
    assert!(
        h.get(&ItemKey::sub_row(EntityKind::Post, "p-1", "view/other"))
            .await
            .is_none()
    );
    assert!(h.core.posts.get_post("p-3").await.unwrap().is_some());
    assert_eq!(h.count(EntityKind::User, "owner", "postCount").await, 1);
    assert_eq!(h.count(EntityKind::User, "other", "commentCount").await, 1);

    assert_eq!(h.core.gc.sweep(Some(3_000)).await.unwrap(), 0);
}

#[tokio::test]
async fn staged_sweeps_match_a_single_sweep() {
    let plan = [("p-1", 2_000), ("p-2", 3_000), ("p-3", 4_000), ("p-4", 9_000)];

    let staged = harness_with_posts(&plan).await;
    let first = staged.core.gc.sweep(Some(2_500)).await.unwrap();
    let second = staged.core.gc.sweep(Some(4_000)).await.unwrap();

    let single = harness_with_posts(&plan).await;
    let once = single.core.gc.sweep(Some(4_000)).await.unwrap();

    assert_eq!((first, second), (1, 2));
    assert_eq!(first + second, once);
    for post_id in ["p-1", "p-2", "p-3", "p-4"] {
        assert_eq!(
            staged.core.posts.get_post(post_id).await.unwrap().is_some(),
            single.core.posts.get_post(post_id).await.unwrap().is_some()
        );
    }
}

#[tokio::test]
async fn cleared_marker_keeps_entity() {
    let h = harness_with_posts(&[("p-1", 2_000)]).await;
    h.store
        .update(
            &UpdateItem::new(ItemKey::root(EntityKind::Post, "p-1"))
                .remove("deleteAt"),
        )
        .await
        .unwrap();

    assert_eq!(h.core.gc.sweep(Some(5_000)).await.unwrap(), 0);
    assert_eq!(h.core.gc.sweep_by_scan(Some(5_000)).await.unwrap(), 0);
    assert!(h.core.posts.get_post("p-1").await.unwrap().is_some());
    assert!(h.core.comments.get_comment("p-1-c").await.unwrap().is_some());
}
