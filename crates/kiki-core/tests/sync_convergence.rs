//! Sync convergence over the in-process transport
//!
//! Several nodes run their own feed writer thread; a `LocalTransport` routes
//! addresses to them the way HTTP would in production.

use std::sync::Arc;

use tempfile::TempDir;

use kiki_core::{
    default_region, ContentKind, Feed, FeedHandle, FeedService, KeyPair, KikiError, Letter,
    LocalTransport, NodeContext, Selector, Settings, Storage, Synchronizer,
};

struct Node {
    handle: FeedHandle,
    sync: Synchronizer,
    _dir: TempDir,
}

fn spawn(region: &KeyPair, settings: Settings, transport: &LocalTransport, address: &str) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path().join("kiki.redb")).unwrap();
    let ctx = NodeContext::new(KeyPair::generate().unwrap(), region.clone(), settings.clone());
    let handle = FeedService::spawn(Feed::new(ctx, storage)).unwrap();
    transport.register(address, handle.clone());
    let sync = Synchronizer::new(handle.clone(), Arc::new(transport.clone()), &settings).unwrap();
    Node {
        handle,
        sync,
        _dir: dir,
    }
}

fn text(data: &str) -> Letter {
    Letter::new(ContentKind::ShareText, data, "").to(Selector::Public)
}

fn pull_only() -> Settings {
    Settings {
        push_on_sync: false,
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_bidirectional_pull_converges() {
    let region = default_region();
    let net = LocalTransport::new();
    let a = spawn(&region, pull_only(), &net, "a");
    let b = spawn(&region, pull_only(), &net, "b");

    a.handle.process_letter(text("a public")).await.unwrap();
    a.handle
        .process_letter(Letter::new(ContentKind::ShareText, "a private", ""))
        .await
        .unwrap();
    b.handle.process_letter(text("b public")).await.unwrap();

    a.sync.pull("b").await.unwrap();
    b.sync.pull("a").await.unwrap();

    let a_ids = a.handle.reader().list_ids().unwrap();
    let b_ids = b.handle.reader().list_ids().unwrap();
    assert_eq!(a_ids.len(), 3);
    assert_eq!(a_ids, b_ids);

    // b stores a's private letter without reading it
    let b_feed = b.handle.reader().show_feed(&Default::default()).unwrap();
    assert_eq!(b_feed.len(), 2);
}

#[tokio::test]
async fn test_push_reaches_fixed_point_in_one_pull() {
    let region = default_region();
    let net = LocalTransport::new();
    let a = spawn(&region, Settings::default(), &net, "a");
    let b = spawn(&region, Settings::default(), &net, "b");
    let c = spawn(&region, Settings::default(), &net, "c");

    for (node, label) in [(&a, "a"), (&b, "b"), (&c, "c")] {
        for n in 0..3 {
            node.handle
                .process_letter(text(&format!("{label} says {n}")))
                .await
                .unwrap();
        }
    }

    a.sync.pull("b").await.unwrap();
    c.sync.pull("b").await.unwrap();
    a.sync.pull("c").await.unwrap();

    let a_ids = a.handle.reader().list_ids().unwrap();
    assert_eq!(a_ids.len(), 9);
    assert_eq!(a_ids, b.handle.reader().list_ids().unwrap());
    assert_eq!(a_ids, c.handle.reader().list_ids().unwrap());

    let report = b.sync.pull("a").await.unwrap();
    assert_eq!(report.missing, 0);
    assert_eq!(report.pushed, 0);
}

#[tokio::test]
async fn test_region_mismatch() {
    let net = LocalTransport::new();
    let a = spawn(&default_region(), Settings::default(), &net, "a");
    let b = spawn(&KeyPair::generate().unwrap(), Settings::default(), &net, "b");
    b.handle.process_letter(text("far away")).await.unwrap();

    let before = a.handle.reader().list_ids().unwrap();
    let result = a.sync.pull("b").await;
    assert!(matches!(result, Err(KikiError::WrongRegion { .. })));
    assert_eq!(a.handle.reader().list_ids().unwrap(), before);

    // a pushes nothing to b either
    assert_eq!(b.handle.reader().list_ids().unwrap().len(), 1);
}

#[tokio::test]
async fn test_friend_key_unlocks_after_sync() {
    let region = default_region();
    let net = LocalTransport::new();
    let i = spawn(&region, pull_only(), &net, "i");
    let j = spawn(&region, pull_only(), &net, "j");
    let i_public = i.handle.reader().context().identity.public().to_string();
    let j_public = j.handle.reader().context().identity.public().to_string();

    // mutual follows make them friends
    i.handle
        .process_letter(
            Letter::new(ContentKind::AssignFollow, "true", "").to(Selector::Literal(j_public.clone())),
        )
        .await
        .unwrap();
    j.handle
        .process_letter(
            Letter::new(ContentKind::AssignFollow, "true", "").to(Selector::Literal(i_public.clone())),
        )
        .await
        .unwrap();
    i.sync.pull("j").await.unwrap();
    j.sync.pull("i").await.unwrap();

    // j posts to friends before i has the key, then shares it
    j.handle.add_friends_key().await.unwrap();
    j.handle
        .process_letter(Letter::new(ContentKind::ShareText, "friends only", "").to(Selector::Friends))
        .await
        .unwrap();
    assert_eq!(j.handle.share_friends_key().await.unwrap(), 1);
    // never resent
    assert_eq!(j.handle.share_friends_key().await.unwrap(), 0);

    i.sync.pull("j").await.unwrap();

    let feed = i.handle.reader().show_feed(&Default::default()).unwrap();
    assert!(feed.iter().any(|p| p.content == "friends only"));
    let me = i.handle.reader().me().unwrap();
    assert_eq!(me.friends, vec![j_public]);
}

#[tokio::test]
async fn test_sync_once_uses_known_peers() {
    let region = default_region();
    let net = LocalTransport::new();
    let seeded = Settings {
        bootstrap_peers: vec!["b".into()],
        push_on_sync: false,
        ..Settings::default()
    };
    let a = spawn(&region, seeded, &net, "a");
    let b = spawn(&region, pull_only(), &net, "b");
    b.handle.process_letter(text("from the seed")).await.unwrap();

    let report = a.sync.sync_once().await.unwrap().unwrap();
    assert_eq!(report.peer, "b");
    assert_eq!(report.ingested, 1);
}
