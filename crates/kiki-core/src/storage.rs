//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Sealed envelopes (the authoritative catalog, keyed by envelope id)
//! - Unsealed envelopes (what this node could open)
//! - A typed key/value namespace of buckets for derived state
//!
//! Both envelope collections carry a secondary `(timestamp_micros, id)` index
//! so they can be walked in time order.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::Database;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::KikiResult;

mod envelopes;
mod kv;

use envelopes::{SEALED_BY_TIME_TABLE, SEALED_TABLE, UNSEALED_BY_TIME_TABLE, UNSEALED_TABLE};
use kv::KV_TABLE;

/// Iteration order for time-indexed scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Outcome of [`Storage::put_sealed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyPresent,
}

/// A sealed envelope plus local bookkeeping that never goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEnvelope {
    pub envelope: Envelope,
    /// True once this node has unsealed it
    pub opened: bool,
    /// When this node first stored it
    pub received_at: DateTime<Utc>,
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and all tables when missing.
    pub fn new(path: impl AsRef<Path>) -> KikiResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SEALED_TABLE)?;
            let _ = write_txn.open_table(SEALED_BY_TIME_TABLE)?;
            let _ = write_txn.open_table(UNSEALED_TABLE)?;
            let _ = write_txn.open_table(UNSEALED_BY_TIME_TABLE)?;
            let _ = write_txn.open_table(KV_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}
