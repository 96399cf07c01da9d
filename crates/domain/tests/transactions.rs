mod common;

use common::Harness;
use ripple_domain::error::DomainError;
use ripple_domain::record::EntityKind;

#[tokio::test]
async fn reused_album_id_raises_its_descriptor_without_counting() {
    let mut h = Harness::new();
    h.add_user("u-1", "ana").await;

    let album = h.core.albums.add_album("a-1", "u-1", "trip", 1_000).await.unwrap();
    assert_eq!(album.name, "trip");
    assert_eq!(h.count(EntityKind::User, "u-1", "albumCount").await, 1);

    let err = h
        .core
        .albums
        .add_album("a-1", "u-1", "again", 2_000)
        .await
        .unwrap_err();
    match err {
        DomainError::Mutation(err) => {
            assert_eq!(err.entity, EntityKind::Album);
            assert_eq!(err.message, "Unable to add album with id `a-1`... id already used?");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(h.count(EntityKind::User, "u-1", "albumCount").await, 1);
    assert_eq!(h.root(EntityKind::Album, "a-1").await.get_str("name"), Some("trip"));
}

#[tokio::test]
async fn album_for_unknown_owner_leaves_nothing_behind() {
    let h = Harness::new();
    let err = h
        .core
        .albums
        .add_album("a-1", "ghost", "trip", 1_000)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Mutation(_)));
    assert!(h.core.albums.get_album("a-1").await.unwrap().is_none());
}

#[tokio::test]
async fn album_delete_floors_owner_count() {
    let mut h = Harness::new();
    h.add_user("u-1", "ana").await;
    h.core.albums.add_album("a-1", "u-1", "trip", 1_000).await.unwrap();

    h.core.albums.delete_album("a-1").await.unwrap();
    assert_eq!(h.count(EntityKind::User, "u-1", "albumCount").await, 0);
    assert!(matches!(
        h.core.albums.delete_album("a-1").await,
        Err(DomainError::NotFound)
    ));
}
