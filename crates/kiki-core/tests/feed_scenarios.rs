//! End-to-end feed scenarios
//!
//! Each node is a `Feed` over its own temporary redb file. "Sync" here means
//! handing every envelope of one store to another node's `ingest_envelope`,
//! which is exactly what the synchronizer does after downloading.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use proptest::prelude::*;
use tempfile::TempDir;

use kiki_core::feed::buckets;
use kiki_core::{
    default_region, ContentKind, Envelope, Feed, FeedParams, IngestOutcome, KeyPair, KikiError,
    Letter, NodeContext, Projection, Selector, Settings, Storage,
};

// ============================================================================
// Helpers
// ============================================================================

fn node_as(identity: KeyPair, region: &KeyPair, settings: Settings) -> (Feed, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path().join("kiki.redb")).unwrap();
    let ctx = NodeContext::new(identity, region.clone(), settings);
    (Feed::new(ctx, storage), dir)
}

fn node(region: &KeyPair) -> (Feed, TempDir) {
    node_as(KeyPair::generate().unwrap(), region, Settings::default())
}

fn public_text(data: &str) -> Letter {
    Letter::new(ContentKind::ShareText, data, "").to(Selector::Public)
}

/// Offer every envelope `from` holds to `to`.
fn sync_from(to: &mut Feed, from: &Feed) -> Vec<IngestOutcome> {
    let mut outcomes = Vec::new();
    for id in from.storage().list_ids().unwrap() {
        let stored = from.storage().get_sealed(&id).unwrap().unwrap();
        outcomes.push(to.ingest_envelope(stored.envelope).unwrap());
    }
    outcomes
}

fn public_of(feed: &Feed) -> String {
    feed.context().identity.public().to_string()
}

fn letter_of(feed: &Feed, envelope: &Envelope) -> Letter {
    feed.storage()
        .get_unsealed(&envelope.id)
        .unwrap()
        .unwrap()
        .letter
}

/// Every derived bucket, byte for byte.
fn snapshot(feed: &Feed) -> BTreeMap<String, BTreeMap<String, Vec<u8>>> {
    buckets::DERIVED
        .iter()
        .map(|bucket| {
            (
                bucket.to_string(),
                feed.storage().kv_bucket_raw(bucket).unwrap(),
            )
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_self_post() {
    let (mut me, _dir) = node(&default_region());
    me.process_letter(public_text("hello")).unwrap();

    let reader = me.reader();
    let posts = reader.show_feed(&FeedParams::default()).unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].content, "hello");
    assert_eq!(posts[0].user.public_key, public_of(&me));
    assert_eq!(reader.list_ids().unwrap().len(), 1);
}

#[test]
fn test_friend_exchange() {
    let region = default_region();
    let (mut i, _di) = node(&region);
    let (mut j, _dj) = node(&region);

    let f = i.add_friends_key().unwrap();
    let g = j.add_friends_key().unwrap();

    let mail = Letter::new(ContentKind::ShareKey, serde_json::to_string(&g).unwrap(), "")
        .to(Selector::Literal(public_of(&i)));
    j.process_letter(mail).unwrap();

    sync_from(&mut i, &j);

    let p = Projection::load(i.storage(), &public_of(&i)).unwrap();
    assert!(p.friend_keys_from.contains(&g));
    assert!(p.friend_keys_for.contains(&f));
    assert!(!p.friend_keys_from.contains(&f));
    assert!(i
        .candidate_keys()
        .unwrap()
        .iter()
        .any(|k| k.public() == g.public()));
}

#[test]
fn test_private_reply() {
    let region = default_region();
    let (mut i, _di) = node(&region);
    let (mut j, _dj) = node(&region);
    let (mut k, _dk) = node(&region);

    let e1 = i.process_letter(public_text("hi")).unwrap();
    let root = letter_of(&i, &e1);
    sync_from(&mut j, &i);

    let reply = Letter::new(ContentKind::ShareText, "hey", "")
        .to(Selector::Literal(public_of(&i)))
        .reply_to(root.first_id.clone());
    let reply_env = j.process_letter(reply).unwrap();
    let reply_letter = letter_of(&j, &reply_env);

    sync_from(&mut i, &j);
    let p = Projection::load(i.storage(), &public_of(&i)).unwrap();
    assert_eq!(p.comments[&root.first_id], vec![reply_letter.first_id.clone()]);

    let thread = i.reader().get_post_comments_for_api(&root.first_id).unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].content, "hey");
    assert_eq!(thread[0].depth, 1);

    // K stores both but can only read the public root
    sync_from(&mut k, &i);
    assert!(k.storage().has_sealed(&reply_env.id).unwrap());
    assert!(k.storage().get_unsealed(&reply_env.id).unwrap().is_none());
    let k_view = Projection::load(k.storage(), &public_of(&k)).unwrap();
    assert!(k_view.posts.contains_key(&root.first_id));
    assert!(!k_view.comments.contains_key(&root.first_id));
}

#[test]
fn test_overwrite() {
    let (mut i, _di) = node(&default_region());
    let e1 = i.process_letter(public_text("original")).unwrap();
    let l1 = letter_of(&i, &e1);

    let e2 = i
        .process_letter(Letter::edit(&l1, "corrected", ""))
        .unwrap();
    let l2 = letter_of(&i, &e2);
    assert_eq!(l2.first_id, l1.first_id);

    let post = i.reader().get_post_for_api(&l1.first_id).unwrap();
    assert_eq!(post.content, "corrected");
    assert_eq!(post.date, e2.timestamp);
    assert_eq!(post.created_at, e1.timestamp);
    assert!(post.edited);

    // one post in the feed, not two
    assert_eq!(i.reader().show_feed(&FeedParams::default()).unwrap().len(), 1);
}

#[test]
fn test_forged_letter_cannot_take_over_a_post() {
    let region = default_region();
    let (mut alice, _da) = node(&region);
    let (mut viewer, _dv) = node(&region);
    let mallory = KeyPair::generate().unwrap();

    let original_env = alice.process_letter(public_text("alice says hi")).unwrap();
    let original = letter_of(&alice, &original_env);
    viewer.ingest_envelope(original_env.clone()).unwrap();

    // alice's ids under mallory's key, backdated and without an attestation
    let mut forged = public_text("pwned");
    forged.id = original.id.clone();
    forged.first_id = original.first_id.clone();
    let mut env = Envelope::seal(&forged, &mallory, &region, &[], &[]).unwrap();
    env.timestamp = original_env.timestamp - chrono::Duration::seconds(60);
    env.signature.clear();

    assert!(matches!(
        viewer.ingest_envelope(env.clone()),
        Err(KikiError::Corrupt(_))
    ));
    assert!(viewer.storage().get_sealed(&env.id).unwrap().is_none());

    // an honest edit by someone else is stored but never shown
    let hijack = Letter::edit(&original, "also pwned", mallory.public()).to(Selector::Public);
    let hijack_env = Envelope::seal(&hijack, &mallory, &region, &[], &[]).unwrap();
    assert_eq!(
        viewer.ingest_envelope(hijack_env).unwrap(),
        IngestOutcome::Stored { opened: true }
    );

    let post = viewer.reader().get_post_for_api(&original.first_id).unwrap();
    assert_eq!(post.content, "alice says hi");
    assert_eq!(post.user.public_key, public_of(&alice));
    assert!(!post.edited);
}

#[test]
fn test_quota_eviction() {
    let region = default_region();
    let tight = Settings {
        storage_per_public_person: 1024,
        ..Settings::default()
    };
    let (mut me, _dm) = node_as(KeyPair::generate().unwrap(), &region, tight);
    let (mut x, _dx) = node(&region);

    let mut ids = Vec::new();
    for ch in ['a', 'b', 'c'] {
        let env = x.process_letter(public_text(&ch.to_string().repeat(500))).unwrap();
        ids.push(env.id.clone());
        me.ingest_envelope(env).unwrap();
    }
    for n in 0..3 {
        me.process_letter(public_text(&n.to_string().repeat(2000))).unwrap();
    }

    me.enforce_quota().unwrap();

    let remaining = me.storage().list_ids().unwrap();
    assert!(!remaining.contains(&ids[0]));
    assert!(remaining.contains(&ids[1]));
    assert!(remaining.contains(&ids[2]));
    // three of ours plus two of x
    assert_eq!(remaining.len(), 5);
    assert!(me.reader().is_evicted(&ids[0]).unwrap());
}

#[test]
fn test_likes_names_and_follows() {
    let region = default_region();
    let (mut i, _di) = node(&region);
    let (mut j, _dj) = node(&region);

    let post_env = i.process_letter(public_text("like me")).unwrap();
    let post = letter_of(&i, &post_env);
    i.process_letter(Letter::new(ContentKind::AssignName, "ivy", "").to(Selector::Public))
        .unwrap();
    sync_from(&mut j, &i);

    j.process_letter(Letter::new(ContentKind::ActionLike, "", "").reply_to(post.first_id.clone()))
        .unwrap();
    j.process_letter(
        Letter::new(ContentKind::AssignFollow, "true", "").to(Selector::Literal(public_of(&i))),
    )
    .unwrap();
    sync_from(&mut i, &j);

    let view = i.reader().get_post_for_api(&post.first_id).unwrap();
    assert_eq!(view.likes, 1);
    assert!(!view.liked);
    assert_eq!(view.user.name, "ivy");

    let me = i.reader().me().unwrap();
    assert_eq!(me.followers, vec![public_of(&j)]);
    assert!(me.friends.is_empty());

    let from_j = j.reader().get_post_for_api(&post.first_id).unwrap();
    assert!(from_j.liked);
}

#[test]
fn test_channels_from_hashtags() {
    let (mut i, _di) = node(&default_region());
    i.process_letter(public_text("solar #DIY #garden")).unwrap();
    i.process_letter(public_text("more #diy")).unwrap();
    i.process_letter(public_text("nothing tagged").channel("notes")).unwrap();

    let reader = i.reader();
    let channels = reader.list_channels().unwrap();
    assert_eq!(channels[0].name, "diy");
    assert_eq!(channels[0].count, 2);

    let params = FeedParams {
        channel: Some("garden".into()),
        ..FeedParams::default()
    };
    let posts = reader.show_feed(&params).unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].content, "solar #DIY #garden");
}

#[test]
fn test_ingest_is_idempotent() {
    let region = default_region();
    let (mut author, _da) = node(&region);
    let (mut viewer, _dv) = node(&region);

    let root = author.process_letter(public_text("root")).unwrap();
    let root_letter = letter_of(&author, &root);
    author
        .process_letter(public_text("child").reply_to(root_letter.first_id))
        .unwrap();
    author
        .process_letter(Letter::new(ContentKind::ShareText, "sealed away", ""))
        .unwrap();

    sync_from(&mut viewer, &author);
    let once = snapshot(&viewer);
    let ids = viewer.storage().list_ids().unwrap();

    let again = sync_from(&mut viewer, &author);
    assert!(again.iter().all(|o| *o == IngestOutcome::AlreadyPresent));
    assert_eq!(snapshot(&viewer), once);
    assert_eq!(viewer.storage().list_ids().unwrap(), ids);
}

// ============================================================================
// Order independence
// ============================================================================

struct Fixture {
    viewer: KeyPair,
    region: KeyPair,
    envelopes: Vec<Envelope>,
    friends_only: String,
    private_to_b: String,
}

fn stamped(kind: ContentKind, data: &str, author: &KeyPair) -> Letter {
    let mut letter = Letter::new(kind, data, "");
    letter.stamp(author.public());
    letter
}

/// A small world: two authors, an edit, a comment, a like, a name, a follow,
/// a private letter, and a friends-only post whose key arrives separately.
static FIXTURE: LazyLock<Fixture> = LazyLock::new(|| {
    let viewer = KeyPair::generate().unwrap();
    let region = KeyPair::generate().unwrap();
    let a = KeyPair::generate().unwrap();
    let b = KeyPair::generate().unwrap();
    let friend_key = KeyPair::generate().unwrap();

    let seal = |letter: &Letter, author: &KeyPair, friends: &[KeyPair]| {
        Envelope::seal(letter, author, &region, friends, &[]).unwrap()
    };

    let post = stamped(ContentKind::ShareText, "first post #rust", &a).to(Selector::Public);
    let edit = Letter::edit(&post, "first post, revised #rust", a.public());
    let comment = stamped(ContentKind::ShareText, "nice", &b)
        .to(Selector::Public)
        .reply_to(post.first_id.clone());
    let like = stamped(ContentKind::ActionLike, "", &b)
        .to(Selector::Public)
        .reply_to(post.first_id.clone());
    let name = stamped(ContentKind::AssignName, "alice", &a).to(Selector::Public);
    let follow = stamped(ContentKind::AssignFollow, "true", &b)
        .to(Selector::Literal(a.public().to_string()))
        .to(Selector::Public);
    let private = stamped(ContentKind::ShareText, "for b only", &a)
        .to(Selector::Literal(b.public().to_string()));
    let share = stamped(
        ContentKind::ShareKey,
        &serde_json::to_string(&friend_key).unwrap(),
        &a,
    )
    .to(Selector::Literal(viewer.public().to_string()));
    let friends_post = stamped(ContentKind::ShareText, "friends only", &a).to(Selector::Friends);

    let friends_env = seal(&friends_post, &a, std::slice::from_ref(&friend_key));
    let private_env = seal(&private, &a, &[]);
    let envelopes = vec![
        seal(&post, &a, &[]),
        seal(&edit, &a, &[]),
        seal(&comment, &b, &[]),
        seal(&like, &b, &[]),
        seal(&name, &a, &[]),
        seal(&follow, &b, &[]),
        private_env.clone(),
        friends_env.clone(),
        seal(&share, &a, &[]),
    ];

    Fixture {
        viewer,
        region,
        friends_only: friends_env.id,
        private_to_b: private_env.id,
        envelopes,
    }
});

const FIXTURE_LEN: usize = 9;

fn ingest_in_order(order: &[usize]) -> (Feed, TempDir) {
    let (mut feed, dir) = node_as(FIXTURE.viewer.clone(), &FIXTURE.region, Settings::default());
    for &i in order {
        feed.ingest_envelope(FIXTURE.envelopes[i].clone()).unwrap();
    }
    (feed, dir)
}

#[test]
fn test_fixture_projection() {
    let order: Vec<usize> = (0..FIXTURE_LEN).collect();
    let (feed, _dir) = ingest_in_order(&order);

    assert!(feed.storage().get_unsealed(&FIXTURE.friends_only).unwrap().is_some());
    assert!(feed.storage().get_unsealed(&FIXTURE.private_to_b).unwrap().is_none());

    let posts = feed.reader().show_feed(&FeedParams::default()).unwrap();
    let revised = posts
        .iter()
        .find(|p| p.content.starts_with("first post"))
        .unwrap();
    assert_eq!(revised.content, "first post, revised #rust");
    assert_eq!(revised.user.name, "alice");
    assert_eq!(revised.likes, 1);
    assert_eq!(revised.comments.len(), 1);
    assert!(posts.iter().any(|p| p.content == "friends only"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any ingest order yields the same derived state
    #[test]
    fn projection_is_order_independent(
        order in Just((0..FIXTURE_LEN).collect::<Vec<usize>>()).prop_shuffle()
    ) {
        let natural: Vec<usize> = (0..FIXTURE_LEN).collect();
        let (baseline, _a) = ingest_in_order(&natural);
        let (shuffled, _b) = ingest_in_order(&order);

        prop_assert_eq!(snapshot(&shuffled), snapshot(&baseline));
        prop_assert_eq!(
            shuffled.storage().unsealed_ids().unwrap(),
            baseline.storage().unsealed_ids().unwrap()
        );
    }
}
