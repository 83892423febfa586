//! Envelope Storage - sealed and unsealed collections
//!
//! Sealed envelopes are stored as JSON `StoredEnvelope`s keyed by envelope
//! id. Unsealed envelopes share the id. Each collection has a time index
//! keyed by `(timestamp_micros, id)` so equal timestamps order by id.

use std::collections::BTreeSet;

use chrono::Utc;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use super::{Order, PutOutcome, Storage, StoredEnvelope};
use crate::envelope::{Envelope, UnsealedEnvelope};
use crate::error::KikiResult;

/// Sealed envelopes (key: envelope id, value: JSON StoredEnvelope)
pub(crate) const SEALED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sealed");

/// Time index over sealed envelopes
pub(crate) const SEALED_BY_TIME_TABLE: TableDefinition<(i64, &str), ()> =
    TableDefinition::new("sealed_by_time");

/// Unsealed envelopes (key: envelope id, value: JSON UnsealedEnvelope)
pub(crate) const UNSEALED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("unsealed");

/// Time index over unsealed envelopes
pub(crate) const UNSEALED_BY_TIME_TABLE: TableDefinition<(i64, &str), ()> =
    TableDefinition::new("unsealed_by_time");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Sealed Envelopes
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a sealed envelope unless one with the same id exists.
    pub fn put_sealed(&self, envelope: &Envelope) -> KikiResult<PutOutcome> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(SEALED_TABLE)?;
            if table.get(envelope.id.as_str())?.is_some() {
                return Ok(PutOutcome::AlreadyPresent);
            }
            let stored = StoredEnvelope {
                envelope: envelope.clone(),
                opened: false,
                received_at: Utc::now(),
            };
            let data = serde_json::to_vec(&stored)?;
            table.insert(envelope.id.as_str(), data.as_slice())?;

            let mut index = write_txn.open_table(SEALED_BY_TIME_TABLE)?;
            index.insert((envelope.timestamp.timestamp_micros(), envelope.id.as_str()), ())?;
        }
        write_txn.commit()?;
        Ok(PutOutcome::Inserted)
    }

    pub fn get_sealed(&self, id: &str) -> KikiResult<Option<StoredEnvelope>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(SEALED_TABLE)?;

        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn has_sealed(&self, id: &str) -> KikiResult<bool> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(SEALED_TABLE)?;
        Ok(table.get(id)?.is_some())
    }

    /// All sealed envelope ids, for sync diffing.
    pub fn list_ids(&self) -> KikiResult<BTreeSet<String>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(SEALED_TABLE)?;

        let mut ids = BTreeSet::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.insert(key.value().to_string());
        }
        Ok(ids)
    }

    pub fn sealed_count(&self) -> KikiResult<u64> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        Ok(read_txn.open_table(SEALED_TABLE)?.len()?)
    }

    /// Sealed envelopes ordered by `(timestamp, id)`.
    pub fn iter_sealed_by_time(&self, order: Order) -> KikiResult<Vec<StoredEnvelope>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let index = read_txn.open_table(SEALED_BY_TIME_TABLE)?;
        let table = read_txn.open_table(SEALED_TABLE)?;

        let mut ids = Vec::new();
        for entry in index.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().1.to_string());
        }
        if order == Order::Descending {
            ids.reverse();
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = table.get(id.as_str())? {
                out.push(serde_json::from_slice(v.value())?);
            }
        }
        Ok(out)
    }

    /// Remove a sealed envelope and its index entry. Missing ids are fine.
    pub fn delete_sealed(&self, id: &str) -> KikiResult<()> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(SEALED_TABLE)?;
            let removed = table.remove(id)?.map(|v| v.value().to_vec());
            if let Some(bytes) = removed {
                let stored: StoredEnvelope = serde_json::from_slice(&bytes)?;
                let mut index = write_txn.open_table(SEALED_BY_TIME_TABLE)?;
                index.remove((stored.envelope.timestamp.timestamp_micros(), id))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Unsealed Envelopes
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert an unsealed envelope and mark its sealed twin as opened.
    pub fn put_unsealed(&self, unsealed: &UnsealedEnvelope) -> KikiResult<()> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let id = unsealed.envelope_id.as_str();
            let mut table = write_txn.open_table(UNSEALED_TABLE)?;
            let data = serde_json::to_vec(unsealed)?;
            table.insert(id, data.as_slice())?;

            let mut index = write_txn.open_table(UNSEALED_BY_TIME_TABLE)?;
            index.insert((unsealed.timestamp.timestamp_micros(), id), ())?;

            let mut sealed = write_txn.open_table(SEALED_TABLE)?;
            let existing = sealed.get(id)?.map(|v| v.value().to_vec());
            if let Some(bytes) = existing {
                let mut stored: StoredEnvelope = serde_json::from_slice(&bytes)?;
                if !stored.opened {
                    stored.opened = true;
                    let data = serde_json::to_vec(&stored)?;
                    sealed.insert(id, data.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_unsealed(&self, id: &str) -> KikiResult<Option<UnsealedEnvelope>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(UNSEALED_TABLE)?;

        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn unsealed_ids(&self) -> KikiResult<BTreeSet<String>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(UNSEALED_TABLE)?;

        let mut ids = BTreeSet::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.insert(key.value().to_string());
        }
        Ok(ids)
    }

    /// Sealed ids with no unsealed counterpart.
    pub fn unopened_ids(&self) -> KikiResult<Vec<String>> {
        let unsealed = self.unsealed_ids()?;
        Ok(self
            .list_ids()?
            .into_iter()
            .filter(|id| !unsealed.contains(id))
            .collect())
    }

    /// Unsealed envelopes ordered by `(timestamp, id)`.
    pub fn iter_unsealed_by_time(&self, order: Order) -> KikiResult<Vec<UnsealedEnvelope>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let index = read_txn.open_table(UNSEALED_BY_TIME_TABLE)?;
        let table = read_txn.open_table(UNSEALED_TABLE)?;

        let mut ids = Vec::new();
        for entry in index.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().1.to_string());
        }
        if order == Order::Descending {
            ids.reverse();
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = table.get(id.as_str())? {
                out.push(serde_json::from_slice(v.value())?);
            }
        }
        Ok(out)
    }

    pub fn delete_unsealed(&self, id: &str) -> KikiResult<()> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(UNSEALED_TABLE)?;
            let removed = table.remove(id)?.map(|v| v.value().to_vec());
            if let Some(bytes) = removed {
                let unsealed: UnsealedEnvelope = serde_json::from_slice(&bytes)?;
                let mut index = write_txn.open_table(UNSEALED_BY_TIME_TABLE)?;
                index.remove((unsealed.timestamp.timestamp_micros(), id))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
