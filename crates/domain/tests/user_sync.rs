mod common;

use common::Harness;
use ripple_domain::card::CardSpec;
use ripple_domain::clients::ClientCall;
use ripple_domain::ports::clients::{CardChange, PushChannel};
use ripple_domain::ports::store::UpdateItem;
use ripple_domain::record::{EntityKind, ItemKey, Record};

fn profile(user_id: &str) -> ItemKey {
    ItemKey::root(EntityKind::User, user_id)
}

#[tokio::test]
async fn profile_changes_reach_search_and_push() {
    let mut h = Harness::new();
    let record = Record::new(&profile("u-1"))
        .with("userId", "u-1")
        .with("username", "ana")
        .with("email", "ana@example.com");
    h.store.put(&record, None).await.unwrap();
    h.settle().await;

    let calls = h.clients.calls();
    assert!(matches!(&calls[0], ClientCall::SearchAdd(doc) if doc.username.as_deref() == Some("ana")));
    assert!(calls.contains(&ClientCall::EndpointUpdate {
        user_id: "u-1".into(),
        channel: PushChannel::Email,
        address: "ana@example.com".into(),
    }));
    h.clients.clear();

    h.store
        .update(&UpdateItem::new(profile("u-1")).set("fullName", "Ana Lima"))
        .await
        .unwrap();
    h.settle().await;
    assert!(matches!(
        h.clients.calls().as_slice(),
        [ClientCall::SearchUpdate(doc)] if doc.full_name.as_deref() == Some("Ana Lima")
    ));
    h.clients.clear();

    h.store
        .update(&UpdateItem::new(profile("u-1")).set("lastManuallyReindexedAt", 5_000))
        .await
        .unwrap();
    h.settle().await;
    assert!(matches!(h.clients.calls().as_slice(), [ClientCall::SearchAdd(_)]));
    h.clients.clear();

    h.store
        .update(
            &UpdateItem::new(profile("u-1"))
                .remove("email")
                .set("userStatus", "DISABLED"),
        )
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(
        h.clients.calls(),
        vec![
            ClientCall::EndpointDelete {
                user_id: "u-1".into(),
                channel: PushChannel::Email,
            },
            ClientCall::EndpointsDisable("u-1".into()),
        ]
    );
    h.clients.clear();

    h.store.delete(&profile("u-1"), None).await.unwrap();
    h.settle().await;
    assert_eq!(
        h.clients.calls(),
        vec![
            ClientCall::SearchDelete("u-1".into()),
            ClientCall::EndpointsDelete("u-1".into()),
        ]
    );
}

#[tokio::test]
async fn follow_requests_drive_counters_and_card() {
    let mut h = Harness::new();
    h.add_user("u-a", "ana").await;
    h.add_user("u-b", "ben").await;
    let row = ItemKey::sub_row(EntityKind::User, "u-a", "follower/u-b");
    let card = CardSpec::RequestedFollowers {
        user_id: "u-a".into(),
    };

    h.store
        .put(&Record::new(&row).with("followStatus", "REQUESTED"), None)
        .await
        .unwrap();
    let delivered = h.settle().await;
    assert_eq!(h.count(EntityKind::User, "u-a", "followersRequestedCount").await, 1);
    assert!(h.get(&card.key()).await.is_some());
    assert_eq!(h.count(EntityKind::User, "u-a", "cardCount").await, 1);

    h.redeliver(&delivered).await;
    assert_eq!(h.count(EntityKind::User, "u-a", "followersRequestedCount").await, 1);
    assert_eq!(h.count(EntityKind::User, "u-a", "cardCount").await, 1);
    h.clients.clear();

    h.store
        .update(&UpdateItem::new(row.clone()).set("followStatus", "FOLLOWING"))
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.count(EntityKind::User, "u-a", "followersRequestedCount").await, 0);
    assert_eq!(h.count(EntityKind::User, "u-a", "followerCount").await, 1);
    assert_eq!(h.count(EntityKind::User, "u-b", "followedCount").await, 1);
    assert!(h.get(&card.key()).await.is_none());

    let card_changes: Vec<CardChange> = h
        .clients
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ClientCall::CardChanged(notification) => Some(notification.change),
            _ => None,
        })
        .collect();
    assert_eq!(card_changes, vec![CardChange::Deleted]);

    h.store.delete(&row, None).await.unwrap();
    h.settle().await;
    assert_eq!(h.count(EntityKind::User, "u-a", "followerCount").await, 0);
    assert_eq!(h.count(EntityKind::User, "u-b", "followedCount").await, 0);
}

#[tokio::test]
async fn deleted_user_loses_cards() {
    let mut h = Harness::new();
    h.add_user("u-a", "ana").await;
    let spec = CardSpec::ChatActivity {
        user_id: "u-a".into(),
    };
    h.core.cards.add_card_if_does_not_exist(&spec, 1_000).await.unwrap();
    assert!(!h.core.cards.add_card_if_does_not_exist(&spec, 2_000).await.unwrap());
    h.settle().await;
    assert_eq!(h.core.cards.list_cards("u-a").await.unwrap().len(), 1);

    h.store.delete(&profile("u-a"), None).await.unwrap();
    h.settle().await;
    assert!(h.core.cards.list_cards("u-a").await.unwrap().is_empty());
    assert!(!h.core.cards.remove_card_if_exists(&spec).await.unwrap());
}
