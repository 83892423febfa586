//! Node settings persisted as `settings.json`

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::KeyPair;
use crate::error::KikiResult;
use crate::letter::DEFAULT_MAX_LETTER_BYTES;

/// Tunables for one node. Missing fields take their defaults so that older
/// files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bytes kept per foreign sender before their oldest envelopes are evicted
    pub storage_per_public_person: u64,
    /// Largest letter payload accepted for authoring
    pub max_letter_bytes: usize,
    pub sync_interval_secs: u64,
    /// Concurrent downloads per pull
    pub sync_parallelism: usize,
    pub request_timeout_secs: u64,
    /// How long a peer serving another region is skipped
    pub wrong_region_backoff_secs: u64,
    pub bootstrap_peers: Vec<String>,
    /// Upload envelopes a peer lacks after pulling from it
    pub push_on_sync: bool,
    pub create_friends_key_on_setup: bool,
    /// How long an evicted id is remembered and refused
    pub tombstone_ttl_secs: u64,
    /// Overrides the built-in deployment region key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<KeyPair>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_per_public_person: 5_000_000,
            max_letter_bytes: DEFAULT_MAX_LETTER_BYTES,
            sync_interval_secs: 600,
            sync_parallelism: 4,
            request_timeout_secs: 30,
            wrong_region_backoff_secs: 3600,
            bootstrap_peers: Vec::new(),
            push_on_sync: true,
            create_friends_key_on_setup: true,
            tombstone_ttl_secs: 30 * 24 * 3600,
            region: None,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> KikiResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> KikiResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.storage_per_public_person, 5_000_000);
        assert_eq!(settings.max_letter_bytes, 2 * 1024 * 1024);
        assert_eq!(settings.sync_interval_secs, 600);
        assert_eq!(settings.sync_parallelism, 4);
        assert_eq!(settings.request_timeout_secs, 30);
        assert_eq!(settings.tombstone_ttl_secs, 2_592_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"storage_per_public_person": 1024}"#).unwrap();
        assert_eq!(settings.storage_per_public_person, 1024);
        assert_eq!(settings.sync_parallelism, 4);
        assert!(settings.region.is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let settings = Settings {
            bootstrap_peers: vec!["http://localhost:8004".into()],
            push_on_sync: false,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }
}
