//! Key pairs and NaCl-compatible encryption
//!
//! Two layers of authenticated encryption are used by envelopes:
//!
//! - **box** (Curve25519 + XSalsa20-Poly1305) between a sender key pair and a
//!   recipient public key, used to wrap the per-envelope secret in each slot.
//! - **secretbox** (XSalsa20-Poly1305) with a fresh random 32-byte secret,
//!   used for the letter itself.
//!
//! # Wire Format
//!
//! Both layers produce `[nonce (24 bytes)] + [ciphertext + tag (16 bytes)]`.
//! Nonces are random; 192-bit nonces make collisions negligible at the message
//! volumes a single key sees.
//!
//! Keys travel as URL-safe base64 (padded) strings.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xsalsa20poly1305::aead::KeyInit;
use xsalsa20poly1305::XSalsa20Poly1305;

use crate::error::{KikiError, KikiResult};

/// Nonce size for XSalsa20 (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Raw key size for both Curve25519 keys and secretbox secrets
pub const KEY_SIZE: usize = 32;

/// Fill a fixed-size buffer from the OS random source.
pub fn random_bytes<const N: usize>() -> KikiResult<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| KikiError::Crypto(format!("OS randomness unavailable: {}", e)))?;
    Ok(buf)
}

/// Hex SHA-256 over the concatenation of `parts`.
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

fn decode_key(s: &str) -> KikiResult<[u8; KEY_SIZE]> {
    let bytes = URL_SAFE
        .decode(s)
        .map_err(|e| KikiError::InvalidKey(format!("not base64: {}", e)))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| KikiError::InvalidKey(format!("expected 32 bytes, got {}", v.len())))
}

/// A Curve25519 key pair, or only its public half.
///
/// Both components are kept in raw form and in their base64 string form.
/// A public-only key pair can be named as a recipient or used to verify the
/// sender of a box, but it cannot decrypt.
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: Option<SecretKey>,
    public_b64: String,
    private_b64: Option<String>,
}

impl KeyPair {
    /// Generate a new random key pair from 32 bytes of OS randomness.
    pub fn generate() -> KikiResult<Self> {
        Ok(Self::from_secret_bytes(random_bytes::<KEY_SIZE>()?))
    }

    /// Derive a full key pair from a raw 32-byte private key.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self {
            public_b64: URL_SAFE.encode(public.as_bytes()),
            private_b64: Some(URL_SAFE.encode(bytes)),
            public,
            secret: Some(secret),
        }
    }

    /// Parse a public-only key pair from its base64 form.
    pub fn from_public(public_b64: &str) -> KikiResult<Self> {
        let bytes = decode_key(public_b64)?;
        Ok(Self {
            public: PublicKey::from(bytes),
            secret: None,
            public_b64: URL_SAFE.encode(bytes),
            private_b64: None,
        })
    }

    /// Parse both halves. The private key must derive the given public key.
    pub fn from_pair(public_b64: &str, private_b64: &str) -> KikiResult<Self> {
        let pair = Self::from_secret_bytes(decode_key(private_b64)?);
        let claimed = decode_key(public_b64)?;
        if pair.public.as_bytes() != &claimed {
            return Err(KikiError::InvalidKey(
                "private key does not match public key".to_string(),
            ));
        }
        Ok(pair)
    }

    /// Base64 form of the public key. This is the identity of a user.
    pub fn public(&self) -> &str {
        &self.public_b64
    }

    /// Base64 form of the private key, if held.
    pub fn private(&self) -> Option<&str> {
        self.private_b64.as_deref()
    }

    pub fn public_bytes(&self) -> &[u8; KEY_SIZE] {
        self.public.as_bytes()
    }

    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    /// Strip the private half.
    pub fn public_only(&self) -> Self {
        Self {
            public: self.public.clone(),
            secret: None,
            public_b64: self.public_b64.clone(),
            private_b64: None,
        }
    }

    fn secret(&self) -> KikiResult<&SecretKey> {
        self.secret.as_ref().ok_or(KikiError::NotOwner)
    }

    /// Box `msg` from this key pair to `recipient`.
    ///
    /// Returns `nonce || ciphertext`. Fails only when randomness is
    /// unavailable or this key pair holds no private key.
    pub fn encrypt(&self, msg: &[u8], recipient: &KeyPair) -> KikiResult<Vec<u8>> {
        let salsa_box = SalsaBox::new(&recipient.public, self.secret()?);
        let nonce_bytes = random_bytes::<NONCE_SIZE>()?;
        let nonce = xsalsa20poly1305::Nonce::from_slice(&nonce_bytes);

        let ciphertext = salsa_box
            .encrypt(nonce, msg)
            .map_err(|e| KikiError::Crypto(format!("box seal failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a box produced by `sender.encrypt(msg, self)`.
    pub fn decrypt(&self, blob: &[u8], sender: &KeyPair) -> KikiResult<Vec<u8>> {
        let secret = self.secret()?;
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KikiError::Auth);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let nonce = xsalsa20poly1305::Nonce::from_slice(nonce_bytes);

        SalsaBox::new(&sender.public, secret)
            .decrypt(nonce, ciphertext)
            .map_err(|_| KikiError::Auth)
    }
}

/// Secretbox `msg` under a fresh random secret.
///
/// Returns `nonce || ciphertext` together with the secret.
pub fn seal_symmetric(msg: &[u8]) -> KikiResult<(Vec<u8>, [u8; KEY_SIZE])> {
    let secret = random_bytes::<KEY_SIZE>()?;
    let nonce_bytes = random_bytes::<NONCE_SIZE>()?;

    let cipher = XSalsa20Poly1305::new(xsalsa20poly1305::Key::from_slice(&secret));
    let ciphertext = cipher
        .encrypt(xsalsa20poly1305::Nonce::from_slice(&nonce_bytes), msg)
        .map_err(|e| KikiError::Crypto(format!("secretbox seal failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok((out, secret))
}

/// Inverse of [`seal_symmetric`].
pub fn open_symmetric(sealed: &[u8], secret: &[u8; KEY_SIZE]) -> KikiResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(KikiError::Auth);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    XSalsa20Poly1305::new(xsalsa20poly1305::Key::from_slice(secret))
        .decrypt(xsalsa20poly1305::Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| KikiError::Auth)
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_b64 == other.public_b64
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_b64)
            .field("private", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.public_b64.get(..8).unwrap_or(&self.public_b64);
        write!(f, "key_{}", short)
    }
}

/// JSON shape of a key pair: `{"public": "...", "private": "..."}`.
///
/// Capitalized field names are accepted on input for interop.
#[derive(Serialize, Deserialize)]
struct KeyPairJson {
    #[serde(alias = "Public")]
    public: String,
    #[serde(
        alias = "Private",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    private: Option<String>,
}

impl Serialize for KeyPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        KeyPairJson {
            public: self.public_b64.clone(),
            private: self.private_b64.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = KeyPairJson::deserialize(deserializer)?;
        let pair = match json.private.as_deref() {
            Some(private) if !private.is_empty() => KeyPair::from_pair(&json.public, private),
            _ => KeyPair::from_public(&json.public),
        };
        pair.map_err(serde::de::Error::custom)
    }
}
