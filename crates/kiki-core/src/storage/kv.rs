//! KV Storage - typed buckets for derived state
//!
//! Every entry is keyed by `(bucket, key)` and holds a JSON value, so a
//! bucket is a contiguous key range.

use std::collections::BTreeMap;

use redb::{ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Storage;
use crate::error::KikiResult;

/// Derived state (key: (bucket, key), value: JSON)
pub(crate) const KV_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("kv");

impl Storage {
    pub fn kv_set<T: Serialize + ?Sized>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
    ) -> KikiResult<()> {
        let data = serde_json::to_vec(value)?;
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert((bucket, key), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn kv_get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> KikiResult<Option<T>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        match table.get((bucket, key))? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn kv_delete(&self, bucket: &str, key: &str) -> KikiResult<()> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.remove((bucket, key))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Every entry of `bucket`, in key order.
    pub fn kv_list<T: DeserializeOwned>(&self, bucket: &str) -> KikiResult<Vec<(String, T)>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        let mut out = Vec::new();
        for entry in table.range((bucket, "")..)? {
            let (key, value) = entry?;
            let (entry_bucket, entry_key) = key.value();
            if entry_bucket != bucket {
                break;
            }
            out.push((entry_key.to_string(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }

    /// Replace the full contents of several buckets in one transaction.
    ///
    /// Buckets not named in `buckets` are left alone. Values are raw JSON.
    pub fn kv_replace_buckets(
        &self,
        buckets: &BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    ) -> KikiResult<()> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            for (bucket, entries) in buckets {
                let mut stale = Vec::new();
                for entry in table.range((bucket.as_str(), "")..)? {
                    let (key, _) = entry?;
                    let (entry_bucket, entry_key) = key.value();
                    if entry_bucket != bucket.as_str() {
                        break;
                    }
                    if !entries.contains_key(entry_key) {
                        stale.push(entry_key.to_string());
                    }
                }
                for key in stale {
                    table.remove((bucket.as_str(), key.as_str()))?;
                }
                for (key, value) in entries {
                    table.insert((bucket.as_str(), key.as_str()), value.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Raw JSON of every entry in `bucket`.
    pub fn kv_bucket_raw(&self, bucket: &str) -> KikiResult<BTreeMap<String, Vec<u8>>> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        let mut out = BTreeMap::new();
        for entry in table.range((bucket, "")..)? {
            let (key, value) = entry?;
            let (entry_bucket, entry_key) = key.value();
            if entry_bucket != bucket {
                break;
            }
            out.insert(entry_key.to_string(), value.value().to_vec());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::create_test_storage;

    #[test]
    fn test_kv_set_get_delete() {
        let (storage, _dir) = create_test_storage();
        storage.kv_set("names", "alice", "Alice").unwrap();

        let name: Option<String> = storage.kv_get("names", "alice").unwrap();
        assert_eq!(name.as_deref(), Some("Alice"));

        storage.kv_delete("names", "alice").unwrap();
        let name: Option<String> = storage.kv_get("names", "alice").unwrap();
        assert!(name.is_none());
    }

    #[test]
    fn test_kv_list_stays_in_bucket() {
        let (storage, _dir) = create_test_storage();
        storage.kv_set("a", "1", &1u32).unwrap();
        storage.kv_set("ab", "2", &2u32).unwrap();
        storage.kv_set("b", "3", &3u32).unwrap();
        storage.kv_set("a", "0", &0u32).unwrap();

        let a: Vec<(String, u32)> = storage.kv_list("a").unwrap();
        assert_eq!(a, vec![("0".to_string(), 0), ("1".to_string(), 1)]);
        let ab: Vec<(String, u32)> = storage.kv_list("ab").unwrap();
        assert_eq!(ab.len(), 1);
    }

    #[test]
    fn test_replace_buckets() {
        let (storage, _dir) = create_test_storage();
        storage.kv_set("likes", "old", &1u32).unwrap();
        storage.kv_set("likes", "kept", &1u32).unwrap();
        storage.kv_set("other", "x", &1u32).unwrap();

        let mut likes = BTreeMap::new();
        likes.insert("kept".to_string(), b"2".to_vec());
        likes.insert("new".to_string(), b"3".to_vec());
        let mut buckets = BTreeMap::new();
        buckets.insert("likes".to_string(), likes);
        storage.kv_replace_buckets(&buckets).unwrap();

        let got: Vec<(String, u32)> = storage.kv_list("likes").unwrap();
        assert_eq!(got, vec![("kept".to_string(), 2), ("new".to_string(), 3)]);
        let other: Option<u32> = storage.kv_get("other", "x").unwrap();
        assert_eq!(other, Some(1));
    }
}
