//! Letter - the plaintext payload of an envelope
//!
//! A letter is typed content plus routing metadata. It only ever exists in
//! plaintext on the node that authored it or on nodes that can unseal the
//! envelope carrying it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{sha256_hex, KeyPair};
use crate::error::{KikiError, KikiResult};

/// Default per-letter payload budget (2 MiB).
pub const DEFAULT_MAX_LETTER_BYTES: usize = 2 * 1024 * 1024;

static HASHTAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)#([A-Za-z0-9_-]+)").unwrap());

/// What a letter means to the projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentKind {
    ShareText,
    SharePng,
    ShareJpeg,
    ShareKey,
    AssignName,
    AssignFollow,
    AssignProfile,
    AssignImage,
    ActionLike,
    ActionComment,
    ActionBlock,
    /// A kind this node does not understand. Kept so that envelopes from
    /// newer peers can be stored; never accepted for authoring.
    Other(String),
}

impl ContentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::ShareText => "share-text",
            ContentKind::SharePng => "share-image/png",
            ContentKind::ShareJpeg => "share-image/jpeg",
            ContentKind::ShareKey => "share-key",
            ContentKind::AssignName => "assign-name",
            ContentKind::AssignFollow => "assign-follow",
            ContentKind::AssignProfile => "assign-profile",
            ContentKind::AssignImage => "assign-image",
            ContentKind::ActionLike => "action-like",
            ContentKind::ActionComment => "action-comment",
            ContentKind::ActionBlock => "action-block",
            ContentKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "share-text" => ContentKind::ShareText,
            "share-image/png" => ContentKind::SharePng,
            "share-image/jpeg" | "share-image/jpg" => ContentKind::ShareJpeg,
            "share-key" => ContentKind::ShareKey,
            "assign-name" => ContentKind::AssignName,
            "assign-follow" => ContentKind::AssignFollow,
            "assign-profile" => ContentKind::AssignProfile,
            "assign-image" => ContentKind::AssignImage,
            "action-like" => ContentKind::ActionLike,
            "action-comment" => ContentKind::ActionComment,
            "action-block" => ContentKind::ActionBlock,
            other => ContentKind::Other(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ContentKind::Other(_))
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentKind::SharePng | ContentKind::ShareJpeg)
    }

    /// Kinds that become visible posts (or comments, with `reply_to`).
    pub fn is_post(&self) -> bool {
        matches!(
            self,
            ContentKind::ShareText
                | ContentKind::SharePng
                | ContentKind::ShareJpeg
                | ContentKind::ActionComment
        )
    }

    /// Actions and follows are always readable by the whole region.
    pub fn is_public_action(&self) -> bool {
        matches!(
            self,
            ContentKind::ActionLike
                | ContentKind::ActionComment
                | ContentKind::ActionBlock
                | ContentKind::AssignFollow
        )
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            ContentKind::SharePng => Some("image/png"),
            ContentKind::ShareJpeg => Some("image/jpeg"),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ContentKind::parse(&s))
    }
}

/// A recipient selector in `Letter::to`.
///
/// `Public` and `Friends` are pseudonyms expanded at seal time; they are
/// never persisted in expanded form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    Literal(String),
    Public,
    Friends,
}

impl Selector {
    pub fn as_str(&self) -> &str {
        match self {
            Selector::Literal(key) => key,
            Selector::Public => "public",
            Selector::Friends => "friends",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "public" => Selector::Public,
            "friends" => Selector::Friends,
            key => Selector::Literal(key.to_string()),
        }
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Selector::parse(&s))
    }
}

/// Plaintext message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Letter {
    pub content_kind: ContentKind,
    pub data: String,
    #[serde(default)]
    pub to: Vec<Selector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub channels: BTreeSet<String>,
    /// SHA-256(sender_public || data), hex
    #[serde(default)]
    pub id: String,
    /// Id of the letter this one edits, or `id` itself
    #[serde(default)]
    pub first_id: String,
}

impl Letter {
    pub fn new(kind: ContentKind, data: impl Into<String>, author_public: &str) -> Self {
        let data = data.into();
        let id = Self::compute_id(author_public, &data);
        Self {
            content_kind: kind,
            data,
            to: Vec::new(),
            reply_to: None,
            channels: BTreeSet::new(),
            first_id: id.clone(),
            id,
        }
    }

    /// New revision of `prior` with different data. Keeps kind, routing, and
    /// `first_id`.
    pub fn edit(prior: &Letter, new_data: impl Into<String>, author_public: &str) -> Self {
        let data = new_data.into();
        let id = Self::compute_id(author_public, &data);
        let first_id = if prior.first_id.is_empty() {
            prior.id.clone()
        } else {
            prior.first_id.clone()
        };
        Self {
            content_kind: prior.content_kind.clone(),
            data,
            to: prior.to.clone(),
            reply_to: prior.reply_to.clone(),
            channels: prior.channels.clone(),
            id,
            first_id,
        }
    }

    pub fn compute_id(author_public: &str, data: &str) -> String {
        sha256_hex(&[author_public.as_bytes(), data.as_bytes()])
    }

    /// True when `id` is the content hash of `data` as written by `sender`.
    pub fn id_matches(&self, sender: &str) -> bool {
        self.id == Self::compute_id(sender, &self.data)
    }

    pub fn to(mut self, selector: Selector) -> Self {
        self.to.push(selector);
        self
    }

    pub fn reply_to(mut self, first_id: impl Into<String>) -> Self {
        self.reply_to = Some(first_id.into());
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.insert(channel.into());
        self
    }

    /// Recompute `id` for `author_public`. A letter that was not an edit
    /// stays one that is not.
    ///
    /// Letters arriving over the local API carry whatever ids the client
    /// guessed; the author's node is the only authority.
    pub fn stamp(&mut self, author_public: &str) {
        let original = self.first_id.is_empty() || self.first_id == self.id;
        self.id = Self::compute_id(author_public, &self.data);
        if original {
            self.first_id = self.id.clone();
        }
    }

    pub fn is_edit(&self) -> bool {
        !self.first_id.is_empty() && self.first_id != self.id
    }

    /// Check kind and data for authoring.
    pub fn validate(&self, max_bytes: usize) -> KikiResult<()> {
        if !self.content_kind.is_known() {
            return Err(KikiError::InvalidKind(self.content_kind.to_string()));
        }
        if self.data.len() > max_bytes {
            return Err(KikiError::InvalidLetter(format!(
                "data of {} bytes exceeds limit of {} bytes",
                self.data.len(),
                max_bytes
            )));
        }

        match &self.content_kind {
            kind if kind.is_image() => {
                let bytes = self.image_bytes()?;
                if bytes.len() > max_bytes {
                    return Err(KikiError::InvalidLetter(format!(
                        "image of {} bytes exceeds limit of {} bytes",
                        bytes.len(),
                        max_bytes
                    )));
                }
            }
            ContentKind::ShareKey => {
                let key: KeyPair = serde_json::from_str(&self.data)
                    .map_err(|e| KikiError::InvalidLetter(format!("share-key payload: {}", e)))?;
                if !key.has_private() {
                    return Err(KikiError::InvalidLetter(
                        "share-key payload has no private key".to_string(),
                    ));
                }
            }
            ContentKind::AssignFollow => {
                if self.follow_value().is_none() {
                    return Err(KikiError::InvalidLetter(
                        "assign-follow data must be \"true\" or \"false\"".to_string(),
                    ));
                }
            }
            ContentKind::ActionLike | ContentKind::ActionComment => {
                if self.reply_to.as_deref().unwrap_or("").is_empty() {
                    return Err(KikiError::InvalidLetter(format!(
                        "{} needs reply_to",
                        self.content_kind
                    )));
                }
            }
            ContentKind::ActionBlock => {
                KeyPair::from_public(self.data.trim())?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Decode the base64 payload of an image letter. Both the standard and
    /// URL-safe alphabets are accepted.
    pub fn image_bytes(&self) -> KikiResult<Vec<u8>> {
        let trimmed = self.data.trim();
        STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(trimmed))
            .map_err(|e| KikiError::InvalidLetter(format!("image data is not base64: {}", e)))
    }

    /// Parsed `assign-follow` payload.
    pub fn follow_value(&self) -> Option<bool> {
        match self.data.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// First literal recipient, the subject of `assign-*` letters.
    pub fn literal_target(&self) -> Option<&str> {
        self.to.iter().find_map(|s| match s {
            Selector::Literal(key) => Some(key.as_str()),
            _ => None,
        })
    }

    /// Lowercased `#tag` words of a text post.
    pub fn hashtags(&self) -> BTreeSet<String> {
        if self.content_kind != ContentKind::ShareText {
            return BTreeSet::new();
        }
        HASHTAG
            .captures_iter(&self.data)
            .map(|c| c[1].to_lowercase())
            .collect()
    }

    /// Explicit channels together with hashtags.
    pub fn all_channels(&self) -> BTreeSet<String> {
        let mut all: BTreeSet<String> = self.channels.iter().map(|c| c.to_lowercase()).collect();
        all.extend(self.hashtags());
        all
    }

    /// Canonical JSON: sorted keys, no whitespace.
    pub fn canonical_json(&self) -> KikiResult<Vec<u8>> {
        // serde_json::Value objects are BTreeMaps, so keys come out sorted
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }
}
