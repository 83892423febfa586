//! Projection - derived state as a pure function of the envelope catalog
//!
//! [`Projection::build`] takes the sealed catalog summary and the unsealed
//! envelopes and produces every derived bucket. It never reads the store, so
//! the same input set always yields the same output regardless of the order
//! envelopes arrived in.
//!
//! Letters are applied in `(timestamp, envelope_id)` order in two phases:
//! first everything that does not reference another letter (posts, keys,
//! names, follows), then everything that does (comments, likes, image
//! assignments), so a reference resolves no matter which side arrived first.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::KeyPair;
use crate::envelope::UnsealedEnvelope;
use crate::error::KikiResult;
use crate::letter::{ContentKind, Letter, Selector};
use crate::storage::Storage;

/// Bucket names in the KV namespace.
pub mod buckets {
    pub const POSTS: &str = "posts";
    pub const COMMENTS: &str = "comments";
    pub const LIKES: &str = "likes";
    pub const NAMES: &str = "assigned_name";
    pub const PROFILES: &str = "assigned_profile";
    pub const IMAGES: &str = "assigned_image";
    pub const FOLLOWS: &str = "follows";
    pub const BLOCKS: &str = "blocks";
    pub const FRIEND_KEYS_FROM: &str = "friend_keys_from";
    pub const FRIEND_KEYS_FOR: &str = "friend_keys_for";
    pub const FRIEND_KEYS_SENT: &str = "friend_keys_sent";
    pub const CHANNELS: &str = "channels";
    pub const PEER_HINTS: &str = "peer_hints";
    pub const STORAGE_USED: &str = "storage_used";

    /// Quota tombstones. Authoritative: never rebuilt by projection.
    pub const EVICTED: &str = "evicted";
    /// Sync peer registry. Authoritative.
    pub const PEERS: &str = "peers";

    pub const DERIVED: &[&str] = &[
        POSTS,
        COMMENTS,
        LIKES,
        NAMES,
        PROFILES,
        IMAGES,
        FOLLOWS,
        BLOCKS,
        FRIEND_KEYS_FROM,
        FRIEND_KEYS_FOR,
        FRIEND_KEYS_SENT,
        CHANNELS,
        PEER_HINTS,
        STORAGE_USED,
    ];
}

/// Channel prefix on `assign-follow` letters that announces a sync address.
pub const PEER_CHANNEL_PREFIX: &str = "peer:";

/// What the projection needs to know about a sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSummary {
    pub id: String,
    pub sender: String,
    pub size: u64,
}

/// A visible post (or comment), keyed by its `first_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub first_id: String,
    /// Letter id of the latest revision
    pub id: String,
    /// Envelope carrying the latest revision
    pub envelope_id: String,
    pub author: String,
    pub kind: ContentKind,
    /// Text of the latest revision; empty for images
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub channels: BTreeSet<String>,
    pub to: Vec<Selector>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Every derived bucket, as seen by one viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub posts: BTreeMap<String, PostRecord>,
    pub comments: BTreeMap<String, Vec<String>>,
    pub likes: BTreeMap<String, BTreeSet<String>>,
    pub names: BTreeMap<String, String>,
    pub profiles: BTreeMap<String, String>,
    pub images: BTreeMap<String, String>,
    pub follows: BTreeMap<String, BTreeSet<String>>,
    pub blocks: BTreeMap<String, BTreeSet<String>>,
    pub friend_keys_from: Vec<KeyPair>,
    pub friend_keys_for: Vec<KeyPair>,
    /// friend public -> friend-key publics already mailed to them
    pub friend_keys_sent: BTreeMap<String, BTreeSet<String>>,
    pub channels: BTreeMap<String, Vec<String>>,
    pub peer_hints: BTreeMap<String, String>,
    pub storage_used: BTreeMap<String, u64>,
}

fn push_key(keys: &mut Vec<KeyPair>, key: KeyPair) {
    if !keys.iter().any(|k| k.public() == key.public()) {
        keys.push(key);
    }
}

impl Projection {
    /// Build from scratch for `viewer`.
    pub fn build(viewer: &str, sealed: &[SealedSummary], unsealed: &[UnsealedEnvelope]) -> Self {
        let mut ordered: Vec<&UnsealedEnvelope> = unsealed.iter().collect();
        ordered.sort_by(|a, b| {
            (a.timestamp, &a.envelope_id).cmp(&(b.timestamp, &b.envelope_id))
        });

        let mut p = Projection::default();

        // The viewer's own blocks hide senders from everything else
        let viewer_blocks: BTreeSet<String> = ordered
            .iter()
            .filter(|u| u.sender == viewer && u.letter.content_kind == ContentKind::ActionBlock)
            .map(|u| u.letter.data.trim().to_string())
            .filter(|target| target.as_str() != viewer)
            .collect();
        let visible: Vec<&UnsealedEnvelope> = ordered
            .into_iter()
            .filter(|u| !viewer_blocks.contains(&u.sender))
            .collect();

        // ── phase 1: self-contained letters ─────────────────────────────────
        let mut revisions: BTreeMap<String, Vec<&UnsealedEnvelope>> = BTreeMap::new();
        for &u in &visible {
            let letter = &u.letter;
            match &letter.content_kind {
                kind if kind.is_post() => {
                    let first_id = if letter.first_id.is_empty() {
                        letter.id.clone()
                    } else {
                        letter.first_id.clone()
                    };
                    revisions.entry(first_id).or_default().push(u);
                }
                ContentKind::ShareKey => p.apply_share_key(viewer, u),
                ContentKind::AssignName => {
                    if let Some(target) = assignment_target(viewer, u) {
                        p.names.insert(target, letter.data.clone());
                    }
                }
                ContentKind::AssignProfile => {
                    if let Some(target) = assignment_target(viewer, u) {
                        p.profiles.insert(target, letter.data.clone());
                    }
                }
                ContentKind::AssignFollow => p.apply_follow(u),
                ContentKind::ActionBlock => {
                    let target = letter.data.trim();
                    if target != u.sender {
                        p.blocks
                            .entry(u.sender.clone())
                            .or_default()
                            .insert(target.to_string());
                    }
                }
                _ => {}
            }
        }

        for (first_id, group) in revisions {
            if let Some(post) = post_from_revisions(&first_id, &group) {
                p.posts.insert(first_id, post);
            }
        }

        // ── phase 2: letters that reference other letters ───────────────────
        for &u in &visible {
            let letter = &u.letter;
            match &letter.content_kind {
                ContentKind::ActionLike => {
                    let Some(target) = letter.reply_to.as_deref() else {
                        continue;
                    };
                    if !p.posts.contains_key(target) {
                        continue;
                    }
                    let likers = p.likes.entry(target.to_string()).or_default();
                    if !likers.remove(&u.sender) {
                        likers.insert(u.sender.clone());
                    }
                }
                ContentKind::AssignImage => {
                    let Some(target) = assignment_target(viewer, u) else {
                        continue;
                    };
                    if let Some(envelope_id) = resolve_image(&p.posts, unsealed, letter.data.trim()) {
                        p.images.insert(target, envelope_id);
                    }
                }
                _ => {}
            }
        }
        p.likes.retain(|_, likers| !likers.is_empty());

        let mut threads: BTreeMap<String, Vec<(DateTime<Utc>, String)>> = BTreeMap::new();
        let mut channels: BTreeMap<String, Vec<(DateTime<Utc>, String)>> = BTreeMap::new();
        for post in p.posts.values() {
            match post.reply_to.as_deref() {
                Some(target) if p.posts.contains_key(target) => {
                    threads
                        .entry(target.to_string())
                        .or_default()
                        .push((post.created_at, post.first_id.clone()));
                }
                Some(_) => {}
                None => {
                    for channel in &post.channels {
                        channels
                            .entry(channel.clone())
                            .or_default()
                            .push((post.created_at, post.first_id.clone()));
                    }
                }
            }
        }
        p.comments = sorted_ids(threads);
        p.channels = sorted_ids(channels);

        // ── storage accounting over the whole sealed catalog ────────────────
        let opened: BTreeMap<&str, u64> = unsealed
            .iter()
            .map(|u| (u.envelope_id.as_str(), u.letter.data.len() as u64))
            .collect();
        for s in sealed {
            let size = opened.get(s.id.as_str()).copied().unwrap_or(s.size);
            *p.storage_used.entry(s.sender.clone()).or_default() += size;
        }

        p
    }

    fn apply_share_key(&mut self, viewer: &str, u: &UnsealedEnvelope) {
        let key: KeyPair = match serde_json::from_str(&u.letter.data) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(envelope = %u.envelope_id, error = %e, "ignoring malformed share-key");
                return;
            }
        };
        if !key.has_private() {
            return;
        }

        if u.sender == viewer {
            for selector in &u.letter.to {
                if let Selector::Literal(friend) = selector {
                    if friend.as_str() != viewer {
                        self.friend_keys_sent
                            .entry(friend.clone())
                            .or_default()
                            .insert(key.public().to_string());
                    }
                }
            }
            push_key(&mut self.friend_keys_for, key);
        } else {
            push_key(&mut self.friend_keys_from, key);
        }
    }

    fn apply_follow(&mut self, u: &UnsealedEnvelope) {
        let letter = &u.letter;
        let (Some(target), Some(follow)) = (letter.literal_target(), letter.follow_value()) else {
            return;
        };
        if target == u.sender {
            return;
        }

        let following = self.follows.entry(u.sender.clone()).or_default();
        if follow {
            following.insert(target.to_string());
        } else {
            following.remove(target);
        }

        for channel in &letter.channels {
            if let Some(address) = channel.strip_prefix(PEER_CHANNEL_PREFIX) {
                if !address.is_empty() {
                    self.peer_hints.insert(address.to_string(), u.sender.clone());
                }
            }
        }
    }

    /// Serialize every derived bucket for [`Storage::kv_replace_buckets`].
    pub fn to_buckets(&self, viewer: &str) -> KikiResult<BTreeMap<String, BTreeMap<String, Vec<u8>>>> {
        let mut out = BTreeMap::new();
        out.insert(buckets::POSTS.to_string(), encode_map(&self.posts)?);
        out.insert(buckets::COMMENTS.to_string(), encode_map(&self.comments)?);
        out.insert(buckets::LIKES.to_string(), encode_map(&self.likes)?);
        out.insert(buckets::NAMES.to_string(), encode_map(&self.names)?);
        out.insert(buckets::PROFILES.to_string(), encode_map(&self.profiles)?);
        out.insert(buckets::IMAGES.to_string(), encode_map(&self.images)?);
        out.insert(buckets::FOLLOWS.to_string(), encode_map(&self.follows)?);
        out.insert(buckets::BLOCKS.to_string(), encode_map(&self.blocks)?);
        out.insert(
            buckets::FRIEND_KEYS_SENT.to_string(),
            encode_map(&self.friend_keys_sent)?,
        );
        out.insert(buckets::CHANNELS.to_string(), encode_map(&self.channels)?);
        out.insert(buckets::PEER_HINTS.to_string(), encode_map(&self.peer_hints)?);
        out.insert(buckets::STORAGE_USED.to_string(), encode_map(&self.storage_used)?);

        let mut from = BTreeMap::new();
        if !self.friend_keys_from.is_empty() {
            from.insert(viewer.to_string(), serde_json::to_vec(&self.friend_keys_from)?);
        }
        out.insert(buckets::FRIEND_KEYS_FROM.to_string(), from);

        let mut for_ = BTreeMap::new();
        if !self.friend_keys_for.is_empty() {
            for_.insert(viewer.to_string(), serde_json::to_vec(&self.friend_keys_for)?);
        }
        out.insert(buckets::FRIEND_KEYS_FOR.to_string(), for_);

        Ok(out)
    }

    /// Read the persisted projection back.
    pub fn load(storage: &Storage, viewer: &str) -> KikiResult<Self> {
        Ok(Self {
            posts: decode_bucket(storage, buckets::POSTS)?,
            comments: decode_bucket(storage, buckets::COMMENTS)?,
            likes: decode_bucket(storage, buckets::LIKES)?,
            names: decode_bucket(storage, buckets::NAMES)?,
            profiles: decode_bucket(storage, buckets::PROFILES)?,
            images: decode_bucket(storage, buckets::IMAGES)?,
            follows: decode_bucket(storage, buckets::FOLLOWS)?,
            blocks: decode_bucket(storage, buckets::BLOCKS)?,
            friend_keys_from: storage
                .kv_get(buckets::FRIEND_KEYS_FROM, viewer)?
                .unwrap_or_default(),
            friend_keys_for: storage
                .kv_get(buckets::FRIEND_KEYS_FOR, viewer)?
                .unwrap_or_default(),
            friend_keys_sent: decode_bucket(storage, buckets::FRIEND_KEYS_SENT)?,
            channels: decode_bucket(storage, buckets::CHANNELS)?,
            peer_hints: decode_bucket(storage, buckets::PEER_HINTS)?,
            storage_used: decode_bucket(storage, buckets::STORAGE_USED)?,
        })
    }

    /// Follows in both directions with `public`.
    pub fn friends_of(&self, public: &str) -> BTreeSet<String> {
        let Some(following) = self.follows.get(public) else {
            return BTreeSet::new();
        };
        following
            .iter()
            .filter(|other| {
                self.follows
                    .get(other.as_str())
                    .is_some_and(|back| back.contains(public))
            })
            .cloned()
            .collect()
    }

    pub fn followers_of(&self, public: &str) -> BTreeSet<String> {
        self.follows
            .iter()
            .filter(|(_, following)| following.contains(public))
            .map(|(follower, _)| follower.clone())
            .collect()
    }
}

/// Subject of an `assign-*` letter, if the sender may assign it.
///
/// Anyone may assign to themselves; only the viewer may assign to others.
fn assignment_target(viewer: &str, u: &UnsealedEnvelope) -> Option<String> {
    let target = u.letter.literal_target().unwrap_or(&u.sender);
    if target == u.sender || u.sender == viewer {
        Some(target.to_string())
    } else {
        None
    }
}

/// Collapse all revisions of one post. The original is the revision whose
/// id hashes from its own sender. Only revisions by that author count; the
/// latest by `(timestamp, envelope_id)` wins.
fn post_from_revisions(first_id: &str, group: &[&UnsealedEnvelope]) -> Option<PostRecord> {
    let original = group
        .iter()
        .find(|u| u.letter.id == first_id && u.letter.id_matches(&u.sender))?;
    let latest = group
        .iter()
        .filter(|u| u.sender == original.sender)
        .max_by(|a, b| (a.timestamp, &a.envelope_id).cmp(&(b.timestamp, &b.envelope_id)))?;

    let letter: &Letter = &latest.letter;
    let kind = original.letter.content_kind.clone();
    Some(PostRecord {
        first_id: first_id.to_string(),
        id: letter.id.clone(),
        envelope_id: latest.envelope_id.clone(),
        author: original.sender.clone(),
        content: if kind.is_image() {
            String::new()
        } else {
            letter.data.clone()
        },
        kind,
        reply_to: original.letter.reply_to.clone(),
        channels: letter.all_channels(),
        to: original.letter.to.clone(),
        created_at: original.timestamp,
        updated_at: latest.timestamp,
    })
}

/// `data` may name an image envelope directly or an image post by first id.
fn resolve_image(
    posts: &BTreeMap<String, PostRecord>,
    unsealed: &[UnsealedEnvelope],
    data: &str,
) -> Option<String> {
    if let Some(post) = posts.get(data).filter(|p| p.kind.is_image()) {
        return Some(post.envelope_id.clone());
    }
    unsealed
        .iter()
        .find(|u| u.envelope_id == data && u.letter.content_kind.is_image())
        .map(|u| u.envelope_id.clone())
}

fn sorted_ids(
    groups: BTreeMap<String, Vec<(DateTime<Utc>, String)>>,
) -> BTreeMap<String, Vec<String>> {
    groups
        .into_iter()
        .map(|(key, mut entries)| {
            entries.sort();
            (key, entries.into_iter().map(|(_, id)| id).collect())
        })
        .collect()
}

fn encode_map<V: Serialize>(map: &BTreeMap<String, V>) -> KikiResult<BTreeMap<String, Vec<u8>>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), serde_json::to_vec(v)?)))
        .collect()
}

fn decode_bucket<V: DeserializeOwned>(
    storage: &Storage,
    bucket: &str,
) -> KikiResult<BTreeMap<String, V>> {
    Ok(storage.kv_list(bucket)?.into_iter().collect())
}
