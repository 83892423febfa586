//! Read-only queries over the committed projection
//!
//! A [`FeedReader`] is cheap to clone and never takes the writer's side of
//! the store; it sees whatever the last committed projection says.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::projection::{PostRecord, Projection};
use crate::envelope::{Envelope, UnsealedEnvelope};
use crate::error::{KikiError, KikiResult};
use crate::identity::NodeContext;
use crate::letter::ContentKind;
use crate::storage::Storage;

/// Reply chains are authored data and may loop; rendering stops here.
const MAX_THREAD_DEPTH: usize = 64;

/// Filters for [`FeedReader::show_feed`]. All optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedParams {
    /// Only posts tagged with this channel
    pub channel: Option<String>,
    /// Only posts by this public key
    pub user: Option<String>,
    /// Only posts by people the viewer follows (and the viewer)
    pub following: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Public face of a user as the viewer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub public_key: String,
    pub name: String,
    pub profile: String,
    /// Envelope id of the profile image, empty when unset
    pub image: String,
    pub followers: Vec<String>,
    pub following: Vec<String>,
    pub friends: Vec<String>,
    pub blocked: Vec<String>,
}

/// A post rendered for the API. Comments nest; `depth` counts from the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostView {
    pub first_id: String,
    pub id: String,
    pub envelope_id: String,
    pub kind: ContentKind,
    /// Text, or `/img/<envelope_id>` for images
    pub content: String,
    pub reply_to: Option<String>,
    pub channels: Vec<String>,
    pub recipients: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the latest revision
    pub date: DateTime<Utc>,
    pub edited: bool,
    pub user: User,
    pub likes: usize,
    pub liked: bool,
    pub depth: usize,
    pub comments: Vec<PostView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user: User,
    pub posts: Vec<PostView>,
    pub user_friends: Vec<User>,
    pub user_followers: Vec<User>,
    pub user_following: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCount {
    pub name: String,
    pub count: usize,
}

#[derive(Clone)]
pub struct FeedReader {
    storage: Storage,
    ctx: NodeContext,
}

impl FeedReader {
    pub fn new(storage: Storage, ctx: NodeContext) -> Self {
        Self { storage, ctx }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn region_public(&self) -> &str {
        self.ctx.region.public()
    }

    pub fn projection(&self) -> KikiResult<Projection> {
        Projection::load(&self.storage, self.ctx.identity.public())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Ids offered to peers. Only region envelopes are ever stored, so this
    /// is the whole catalog.
    pub fn list_ids(&self) -> KikiResult<BTreeSet<String>> {
        self.storage.list_ids()
    }

    pub fn get_envelope(&self, id: &str) -> KikiResult<Option<Envelope>> {
        Ok(self.storage.get_sealed(id)?.map(|s| s.envelope))
    }

    pub fn is_evicted(&self, id: &str) -> KikiResult<bool> {
        Ok(self
            .storage
            .kv_get::<super::Tombstone>(super::buckets::EVICTED, id)?
            .is_some())
    }

    /// Sync addresses announced through `assign-follow` letters.
    pub fn peer_hints(&self) -> KikiResult<Vec<String>> {
        Ok(self
            .storage
            .kv_list::<String>(super::buckets::PEER_HINTS)?
            .into_iter()
            .map(|(address, _)| address)
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Feed
    // ═══════════════════════════════════════════════════════════════════════

    /// Top-level posts visible to the viewer, newest first, with their
    /// comment threads.
    pub fn show_feed(&self, params: &FeedParams) -> KikiResult<Vec<PostView>> {
        let p = self.projection()?;
        let viewer = self.ctx.identity.public();
        let following = p.follows.get(viewer).cloned().unwrap_or_default();
        let channel = params.channel.as_ref().map(|c| c.to_lowercase());

        let mut roots: Vec<&PostRecord> = p
            .posts
            .values()
            .filter(|post| post.reply_to.is_none())
            .filter(|post| {
                channel
                    .as_ref()
                    .map_or(true, |c| post.channels.contains(c))
            })
            .filter(|post| params.user.as_ref().map_or(true, |u| &post.author == u))
            .filter(|post| {
                !params.following || post.author == viewer || following.contains(&post.author)
            })
            .filter(|post| params.since.map_or(true, |t| post.created_at >= t))
            .filter(|post| params.until.map_or(true, |t| post.created_at <= t))
            .collect();
        roots.sort_by(|a, b| (b.created_at, &b.first_id).cmp(&(a.created_at, &a.first_id)));
        if let Some(limit) = params.limit {
            roots.truncate(limit);
        }

        let mut users = BTreeMap::new();
        Ok(roots
            .into_iter()
            .map(|post| self.render(&p, post, 0, true, &mut users))
            .collect())
    }

    /// Same as [`show_feed`](Self::show_feed); the API name for it.
    pub fn list_posts_for_api(&self, params: &FeedParams) -> KikiResult<Vec<PostView>> {
        self.show_feed(params)
    }

    /// One post with its comment thread, by `first_id`.
    pub fn get_post_for_api(&self, first_id: &str) -> KikiResult<PostView> {
        let p = self.projection()?;
        let post = p
            .posts
            .get(first_id)
            .ok_or_else(|| KikiError::NotFound(format!("post {}", first_id)))?;
        let mut users = BTreeMap::new();
        Ok(self.render(&p, post, 0, true, &mut users))
    }

    /// The comment thread under `first_id`, flattened depth-first.
    pub fn get_post_comments_for_api(&self, first_id: &str) -> KikiResult<Vec<PostView>> {
        let p = self.projection()?;
        if !p.posts.contains_key(first_id) {
            return Err(KikiError::NotFound(format!("post {}", first_id)));
        }
        let mut users = BTreeMap::new();
        let mut out = Vec::new();
        self.flatten_thread(&p, first_id, 1, &mut users, &mut out);
        Ok(out)
    }

    fn flatten_thread(
        &self,
        p: &Projection,
        first_id: &str,
        depth: usize,
        users: &mut BTreeMap<String, User>,
        out: &mut Vec<PostView>,
    ) {
        if depth > MAX_THREAD_DEPTH {
            return;
        }
        for child_id in p.comments.get(first_id).into_iter().flatten() {
            if let Some(child) = p.posts.get(child_id) {
                out.push(self.render(p, child, depth, false, users));
                self.flatten_thread(p, child_id, depth + 1, users, out);
            }
        }
    }

    fn render(
        &self,
        p: &Projection,
        post: &PostRecord,
        depth: usize,
        with_comments: bool,
        users: &mut BTreeMap<String, User>,
    ) -> PostView {
        let viewer = self.ctx.identity.public();
        let likers = p.likes.get(&post.first_id);
        let user = users
            .entry(post.author.clone())
            .or_insert_with(|| user_from(p, &post.author))
            .clone();

        let comments = if with_comments && depth < MAX_THREAD_DEPTH {
            p.comments
                .get(&post.first_id)
                .into_iter()
                .flatten()
                .filter_map(|id| p.posts.get(id))
                .map(|child| self.render(p, child, depth + 1, true, users))
                .collect()
        } else {
            Vec::new()
        };

        PostView {
            first_id: post.first_id.clone(),
            id: post.id.clone(),
            envelope_id: post.envelope_id.clone(),
            kind: post.kind.clone(),
            content: if post.kind.is_image() {
                format!("/img/{}", post.envelope_id)
            } else {
                post.content.clone()
            },
            reply_to: post.reply_to.clone(),
            channels: post.channels.iter().cloned().collect(),
            recipients: post.to.iter().map(|s| s.as_str().to_string()).collect(),
            created_at: post.created_at,
            date: post.updated_at,
            edited: post.id != post.first_id,
            user,
            likes: likers.map_or(0, |l| l.len()),
            liked: likers.is_some_and(|l| l.contains(viewer)),
            depth,
            comments,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Users
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_user_for_api(&self, public: &str) -> KikiResult<User> {
        Ok(user_from(&self.projection()?, public))
    }

    /// The viewer's own user record.
    pub fn me(&self) -> KikiResult<User> {
        self.get_user_for_api(self.ctx.identity.public())
    }

    pub fn show_profile(&self, public: &str) -> KikiResult<Profile> {
        let p = self.projection()?;
        let user = user_from(&p, public);
        let posts = self.show_feed(&FeedParams {
            user: Some(public.to_string()),
            ..FeedParams::default()
        })?;
        let users = |keys: &[String]| -> Vec<User> { keys.iter().map(|k| user_from(&p, k)).collect() };

        Ok(Profile {
            user_friends: users(&user.friends),
            user_followers: users(&user.followers),
            user_following: users(&user.following),
            posts,
            user,
        })
    }

    /// Posts per channel, busiest first.
    pub fn list_channels(&self) -> KikiResult<Vec<ChannelCount>> {
        let mut channels: Vec<ChannelCount> = self
            .projection()?
            .channels
            .into_iter()
            .map(|(name, posts)| ChannelCount {
                name,
                count: posts.len(),
            })
            .collect();
        channels.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        Ok(channels)
    }

    /// Decoded bytes and MIME type of an image, by envelope id or post
    /// first id.
    pub fn image_bytes(&self, id: &str) -> KikiResult<(&'static str, Vec<u8>)> {
        let unsealed = match self.storage.get_unsealed(id)? {
            Some(u) => u,
            None => {
                let post: PostRecord = self
                    .storage
                    .kv_get(super::buckets::POSTS, id)?
                    .ok_or_else(|| KikiError::NotFound(format!("image {}", id)))?;
                self.storage
                    .get_unsealed(&post.envelope_id)?
                    .ok_or_else(|| KikiError::NotFound(format!("image {}", id)))?
            }
        };
        image_of(&unsealed)
    }
}

fn image_of(unsealed: &UnsealedEnvelope) -> KikiResult<(&'static str, Vec<u8>)> {
    let mime = unsealed
        .letter
        .content_kind
        .mime_type()
        .ok_or_else(|| KikiError::NotFound(format!("image {}", unsealed.envelope_id)))?;
    Ok((mime, unsealed.letter.image_bytes()?))
}

fn user_from(p: &Projection, public: &str) -> User {
    User {
        public_key: public.to_string(),
        name: p.names.get(public).cloned().unwrap_or_default(),
        profile: p.profiles.get(public).cloned().unwrap_or_default(),
        image: p.images.get(public).cloned().unwrap_or_default(),
        followers: p.followers_of(public).into_iter().collect(),
        following: p
            .follows
            .get(public)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default(),
        friends: p.friends_of(public).into_iter().collect(),
        blocked: p
            .blocks
            .get(public)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    use crate::feed::test_support::{feed_in_region, test_feed};
    use crate::feed::FeedParams;
    use crate::letter::{ContentKind, Letter, Selector};
    use crate::settings::Settings;

    fn public(kind: ContentKind, data: &str) -> Letter {
        Letter::new(kind, data, "").to(Selector::Public)
    }

    #[test]
    fn test_feed_nests_comments_and_counts_likes() {
        let (mut feed, _dir) = test_feed();
        let root_env = feed.process_letter(public(ContentKind::ShareText, "root")).unwrap();
        let root = feed.storage().get_unsealed(&root_env.id).unwrap().unwrap().letter;

        let reply_env = feed
            .process_letter(public(ContentKind::ShareText, "reply").reply_to(root.first_id.clone()))
            .unwrap();
        let reply = feed.storage().get_unsealed(&reply_env.id).unwrap().unwrap().letter;
        feed.process_letter(
            public(ContentKind::ShareText, "nested").reply_to(reply.first_id.clone()),
        )
        .unwrap();
        feed.process_letter(Letter::new(ContentKind::ActionLike, "", "").reply_to(root.first_id.clone()))
            .unwrap();

        let reader = feed.reader();
        let posts = reader.show_feed(&FeedParams::default()).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].likes, 1);
        assert!(posts[0].liked);
        assert_eq!(posts[0].comments.len(), 1);
        assert_eq!(posts[0].comments[0].depth, 1);
        assert_eq!(posts[0].comments[0].comments[0].content, "nested");

        let flat = reader.get_post_comments_for_api(&root.first_id).unwrap();
        let shape: Vec<_> = flat.iter().map(|c| (c.content.as_str(), c.depth)).collect();
        assert_eq!(shape, vec![("reply", 1), ("nested", 2)]);
    }

    #[test]
    fn test_feed_filters() {
        let (mut me, _a) = test_feed();
        let region = me.context().region.clone();
        let (mut other, _b) = feed_in_region(&region, Settings::default());

        me.process_letter(public(ContentKind::ShareText, "mine #rust")).unwrap();
        let theirs = other
            .process_letter(public(ContentKind::ShareText, "theirs"))
            .unwrap();
        me.ingest_envelope(theirs).unwrap();

        let reader = me.reader();
        assert_eq!(reader.show_feed(&FeedParams::default()).unwrap().len(), 2);

        let following = FeedParams {
            following: true,
            ..FeedParams::default()
        };
        let mine_only = reader.show_feed(&following).unwrap();
        assert_eq!(mine_only.len(), 1);
        assert_eq!(mine_only[0].content, "mine #rust");

        let rust = FeedParams {
            channel: Some("Rust".into()),
            ..FeedParams::default()
        };
        assert_eq!(reader.show_feed(&rust).unwrap().len(), 1);

        let limited = FeedParams {
            limit: Some(1),
            ..FeedParams::default()
        };
        assert_eq!(reader.show_feed(&limited).unwrap()[0].content, "theirs");

        let channels = reader.list_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "rust");
    }

    #[test]
    fn test_profile_and_user() {
        let (mut me, _a) = test_feed();
        let me_public = me.context().identity.public().to_string();
        me.process_letter(public(ContentKind::AssignName, "Zed")).unwrap();
        me.process_letter(public(ContentKind::AssignProfile, "hello there")).unwrap();

        let image_env = me
            .process_letter(public(ContentKind::SharePng, &STANDARD.encode([1u8, 2, 3])))
            .unwrap();
        me.process_letter(public(ContentKind::AssignImage, &image_env.id)).unwrap();

        let reader = me.reader();
        let user = reader.me().unwrap();
        assert_eq!(user.name, "Zed");
        assert_eq!(user.profile, "hello there");
        assert_eq!(user.image, image_env.id);

        let (mime, bytes) = reader.image_bytes(&user.image).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![1, 2, 3]);

        let profile = reader.show_profile(&me_public).unwrap();
        assert_eq!(profile.posts.len(), 1);
        assert_eq!(profile.posts[0].content, format!("/img/{}", image_env.id));
    }

    #[test]
    fn test_missing_post_is_not_found() {
        let (feed, _dir) = test_feed();
        let reader = feed.reader();
        assert!(reader.get_post_for_api("nope").is_err());
        assert!(reader.get_post_comments_for_api("nope").is_err());
        assert!(reader.image_bytes("nope").is_err());
    }
}
