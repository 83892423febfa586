//! Envelope - the sealed, shareable unit
//!
//! An envelope carries one letter sealed under a fresh random secret, plus
//! one recipient slot per reader holding that secret boxed from the sender
//! to the reader's public key.
//!
//! # Seal
//!
//! ```text
//! letter ──canonical JSON──▶ zlib ──secretbox(secret)──▶ sealed_content
//! secret ──box(author → recipient_i)──▶ slot_i          (shuffled)
//! id = SHA-256(sender_public || sealed_content)
//! signature = box(author → region, SHA-256(id, timestamp, slots))
//! ```
//!
//! The id makes `sender` and `sealed_content` self-verifying. The region
//! attestation (`signature`) binds the timestamp and recipient slots to the
//! id so that every node in the region can detect tampering with them. Since
//! the region private key is shared, the attestation proves nothing to a
//! region member about who wrote it; per-slot box authentication is what
//! ties a sender to a reader.

use std::collections::HashSet;
use std::io::{Read, Write};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, SubsecRound, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::crypto::{open_symmetric, seal_symmetric, sha256_hex, KeyPair, KEY_SIZE};
use crate::error::{KikiError, KikiResult};
use crate::letter::{Letter, Selector};

/// Upper bound on a decompressed letter. Guards against zlib bombs.
const MAX_DECOMPRESSED_BYTES: u64 = 32 * 1024 * 1024;

/// Sealed envelope as stored and transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "sender_json")]
    pub sender: KeyPair,
    pub recipients: Vec<String>,
    pub sealed_content: String,
    /// Region attestation; see module docs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

/// Result of opening an envelope. Local only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealedEnvelope {
    pub envelope_id: String,
    pub letter: Letter,
    pub sender: String,
    /// Public keys known to be recipients: only the key that opened it
    pub recipient_publics: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Expand `letter.to` into concrete recipients.
///
/// `public` becomes the region key, `friends` becomes every friend key the
/// author hands out, literals are parsed and dropped when invalid. The
/// author is always included; duplicates are removed.
pub fn resolve_recipients(
    letter: &Letter,
    author: &KeyPair,
    region: &KeyPair,
    friend_keys_for: &[KeyPair],
    explicit: &[KeyPair],
) -> Vec<KeyPair> {
    let mut resolved: Vec<KeyPair> = explicit.iter().map(KeyPair::public_only).collect();

    for selector in &letter.to {
        match selector {
            Selector::Public => resolved.push(region.public_only()),
            Selector::Friends => {
                if friend_keys_for.is_empty() {
                    tracing::debug!(letter = %letter.id, "no friend keys yet, 'friends' expands to nobody");
                }
                resolved.extend(friend_keys_for.iter().map(KeyPair::public_only));
            }
            Selector::Literal(key) => match KeyPair::from_public(key) {
                Ok(kp) => resolved.push(kp),
                Err(e) => tracing::warn!(recipient = %key, error = %e, "dropping invalid recipient"),
            },
        }
    }
    resolved.push(author.public_only());

    let mut seen = HashSet::new();
    resolved.retain(|kp| seen.insert(kp.public().to_string()));
    resolved
}

impl Envelope {
    /// Seal `letter` from `author` to its resolved recipients.
    pub fn seal(
        letter: &Letter,
        author: &KeyPair,
        region: &KeyPair,
        friend_keys_for: &[KeyPair],
        explicit: &[KeyPair],
    ) -> KikiResult<Self> {
        let recipients = resolve_recipients(letter, author, region, friend_keys_for, explicit);
        Self::seal_to(letter, author, region, &recipients)
    }

    /// Seal `letter` to an already-resolved recipient list.
    pub fn seal_to(
        letter: &Letter,
        author: &KeyPair,
        region: &KeyPair,
        recipients: &[KeyPair],
    ) -> KikiResult<Self> {
        let compressed = compress(&letter.canonical_json()?)?;
        let (sealed, secret) = seal_symmetric(&compressed)?;
        let sealed_content = URL_SAFE.encode(sealed);

        let mut slots = Vec::with_capacity(recipients.len() + 1);
        for recipient in recipients {
            slots.push(URL_SAFE.encode(author.encrypt(&secret, recipient)?));
        }
        if !recipients.iter().any(|r| r.public() == author.public()) {
            slots.push(URL_SAFE.encode(author.encrypt(&secret, author)?));
        }
        slots.shuffle(&mut rand::rng());

        let mut envelope = Self {
            id: Self::compute_id(author.public(), &sealed_content),
            sender: author.public_only(),
            recipients: slots,
            sealed_content,
            signature: String::new(),
            timestamp: Utc::now().trunc_subsecs(6),
        };
        let digest = envelope.attestation_digest();
        envelope.signature = URL_SAFE.encode(author.encrypt(digest.as_bytes(), region)?);

        tracing::debug!(
            id = %envelope.id,
            kind = %letter.content_kind,
            slots = envelope.recipients.len(),
            "sealed envelope"
        );
        Ok(envelope)
    }

    pub fn compute_id(sender_public: &str, sealed_content: &str) -> String {
        sha256_hex(&[sender_public.as_bytes(), sealed_content.as_bytes()])
    }

    pub fn verify_id(&self) -> bool {
        Self::compute_id(self.sender.public(), &self.sealed_content) == self.id
    }

    /// Bytes charged to the sender's storage quota while sealed.
    pub fn size(&self) -> usize {
        self.sealed_content.len()
    }

    fn attestation_digest(&self) -> String {
        let micros = self.timestamp.timestamp_micros().to_string();
        let mut parts: Vec<&[u8]> = vec![self.id.as_bytes(), b"\n", micros.as_bytes()];
        for slot in &self.recipients {
            parts.push(b"\n");
            parts.push(slot.as_bytes());
        }
        sha256_hex(&parts)
    }

    /// Whether `region` can open the attestation and it matches this
    /// envelope's id, timestamp, and slots.
    pub fn attestation_valid(&self, region: &KeyPair) -> bool {
        let Ok(blob) = URL_SAFE.decode(&self.signature) else {
            return false;
        };
        match region.decrypt(&blob, &self.sender) {
            Ok(digest) => digest == self.attestation_digest().as_bytes(),
            Err(_) => false,
        }
    }

    /// Whether this envelope belongs to the region.
    ///
    /// True when the region attestation holds, when a slot opens with the
    /// region key, or when `local_identity` authored it.
    pub fn validated_for_region(&self, region: &KeyPair, local_identity: &KeyPair) -> bool {
        if self.sender.public() == local_identity.public() {
            return true;
        }
        if !self.signature.is_empty() && self.attestation_valid(region) {
            return true;
        }
        self.open_secret(std::slice::from_ref(region)).is_ok()
    }

    /// Find the first candidate key that opens a slot.
    fn open_secret(&self, candidates: &[KeyPair]) -> KikiResult<([u8; KEY_SIZE], String)> {
        let mut slots = Vec::with_capacity(self.recipients.len());
        for slot in &self.recipients {
            let blob = URL_SAFE
                .decode(slot)
                .map_err(|e| KikiError::Corrupt(format!("recipient slot is not base64: {}", e)))?;
            slots.push(blob);
        }

        for candidate in candidates.iter().filter(|c| c.has_private()) {
            for blob in &slots {
                match candidate.decrypt(blob, &self.sender) {
                    Ok(secret) => {
                        let secret: [u8; KEY_SIZE] = secret.try_into().map_err(|_| {
                            KikiError::Corrupt("recipient slot holds a malformed secret".into())
                        })?;
                        return Ok((secret, candidate.public().to_string()));
                    }
                    Err(KikiError::Auth) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(KikiError::NotRecipient)
    }

    /// Open this envelope with the first candidate key that fits.
    ///
    /// `candidates` are tried in order. The attestation is checked with
    /// `region` whenever present.
    pub fn unseal(&self, candidates: &[KeyPair], region: &KeyPair) -> KikiResult<UnsealedEnvelope> {
        if !self.verify_id() {
            return Err(KikiError::Corrupt(format!("id mismatch for {}", self.id)));
        }
        if !self.signature.is_empty() && !self.attestation_valid(region) {
            return Err(KikiError::Corrupt(format!(
                "region attestation does not match {}",
                self.id
            )));
        }

        let (secret, opened_by) = self.open_secret(candidates)?;

        let sealed = URL_SAFE
            .decode(&self.sealed_content)
            .map_err(|e| KikiError::Corrupt(format!("sealed content is not base64: {}", e)))?;
        let compressed = open_symmetric(&sealed, &secret)
            .map_err(|_| KikiError::Corrupt("sealed content failed authentication".into()))?;
        let json = decompress(&compressed)?;
        let letter: Letter = serde_json::from_slice(&json)
            .map_err(|e| KikiError::Corrupt(format!("letter is not valid JSON: {}", e)))?;
        if !letter.id_matches(self.sender.public()) {
            return Err(KikiError::Corrupt(format!(
                "letter id {} is not the hash of its sender and data",
                letter.id
            )));
        }

        Ok(UnsealedEnvelope {
            envelope_id: self.id.clone(),
            letter,
            sender: self.sender.public().to_string(),
            recipient_publics: vec![opened_by],
            timestamp: self.timestamp,
        })
    }
}

fn compress(bytes: &[u8]) -> KikiResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn decompress(bytes: &[u8]) -> KikiResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_DECOMPRESSED_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| KikiError::Corrupt(format!("letter does not decompress: {}", e)))?;
    Ok(out)
}

/// The sender travels as `{"Public": "..."}`.
mod sender_json {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::crypto::KeyPair;

    #[derive(Serialize, Deserialize)]
    struct SenderJson {
        #[serde(rename = "Public", alias = "public")]
        public: String,
    }

    pub fn serialize<S: Serializer>(key: &KeyPair, serializer: S) -> Result<S::Ok, S::Error> {
        SenderJson {
            public: key.public().to_string(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<KeyPair, D::Error> {
        let json = SenderJson::deserialize(deserializer)?;
        KeyPair::from_public(&json.public).map_err(serde::de::Error::custom)
    }
}
