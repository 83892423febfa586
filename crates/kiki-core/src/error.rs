//! Error types for Kiki

use thiserror::Error;

/// Main error type for Kiki operations
#[derive(Error, Debug)]
pub enum KikiError {
    /// Envelope failed integrity checks: hash mismatch, malformed base64,
    /// undecodable letter, or a MAC failure on the sealed content.
    #[error("Corrupt envelope: {0}")]
    Corrupt(String),

    /// None of the candidate keys opened a recipient slot.
    #[error("Not a recipient of this envelope")]
    NotRecipient,

    /// A single box failed to authenticate (wrong key pair or tampered slot).
    #[error("Authentication failed")]
    Auth,

    /// Decryption requires a private key that this key pair does not hold.
    #[error("Key pair has no private component")]
    NotOwner,

    /// A sync peer serves a different region.
    #[error("Peer serves region {found}, expected {expected}")]
    WrongRegion { expected: String, found: String },

    /// An envelope alone is larger than its sender's storage budget.
    #[error("Envelope of {size} bytes exceeds the {limit} byte budget of {sender}")]
    QuotaExceeded { sender: String, size: u64, limit: u64 },

    /// Unknown `content_kind`.
    #[error("Invalid letter kind: {0}")]
    InvalidKind(String),

    /// Letter content failed validation for its kind.
    #[error("Invalid letter: {0}")]
    InvalidLetter(String),

    /// Key material could not be parsed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Sender is blocked by the local identity.
    #[error("Sender is blocked: {0}")]
    Blocked(String),

    /// Requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed (RNG failure, cipher setup)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl KikiError {
    /// Whether the failure is transient (store or network) and worth retrying
    /// on the next sync tick. Content errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KikiError::Database(_)
                | KikiError::Transaction(_)
                | KikiError::Table(_)
                | KikiError::StorageOp(_)
                | KikiError::Commit(_)
                | KikiError::Network(_)
                | KikiError::Io(_)
        )
    }
}

impl From<serde_json::Error> for KikiError {
    fn from(e: serde_json::Error) -> Self {
        KikiError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for KikiError {
    fn from(e: reqwest::Error) -> Self {
        KikiError::Network(e.to_string())
    }
}

/// Result type alias using KikiError
pub type KikiResult<T> = Result<T, KikiError>;
