//! Peer registry for sync
//!
//! Every address this node has heard of, with enough bookkeeping to decide
//! whom to pull from next. Peers come from three places:
//! - `bootstrap_peers` in settings
//! - `peer:<address>` channels on `assign-follow` letters (peer hints)
//! - explicit `POST /sync` requests
//!
//! Failed peers back off on a Fibonacci schedule. A peer that serves another
//! region is parked for `wrong_region_backoff_secs`.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::KikiResult;
use crate::feed::{buckets, FeedReader};
use crate::settings::Settings;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSource {
    Bootstrap,
    Hint,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Unknown,
    Online,
    Offline,
    /// Served a different region key
    WrongRegion,
}

/// Information about a known sync peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// `host:port` or base URL
    pub address: String,
    pub source: PeerSource,
    pub status: PeerStatus,
    /// Unix timestamp of the last successful sync
    pub last_seen: u64,
    #[serde(default)]
    pub connection_attempts: u32,
    #[serde(default)]
    pub successful_connections: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Unix timestamp of last attempt
    #[serde(default)]
    pub last_attempt: u64,
    /// Skipped until this Unix timestamp
    #[serde(default)]
    pub parked_until: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl PeerInfo {
    pub fn new(address: impl Into<String>, source: PeerSource) -> Self {
        Self {
            address: address.into(),
            source,
            status: PeerStatus::Unknown,
            last_seen: 0,
            connection_attempts: 0,
            successful_connections: 0,
            consecutive_failures: 0,
            last_attempt: 0,
            parked_until: 0,
        }
    }

    pub fn record_attempt(&mut self) {
        self.connection_attempts += 1;
        self.last_attempt = current_timestamp();
    }

    pub fn record_success(&mut self) {
        self.successful_connections += 1;
        self.consecutive_failures = 0;
        self.status = PeerStatus::Online;
        self.last_seen = current_timestamp();
        self.parked_until = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.status = PeerStatus::Offline;
    }

    pub fn record_wrong_region(&mut self, backoff_secs: u64) {
        self.status = PeerStatus::WrongRegion;
        self.parked_until = current_timestamp().saturating_add(backoff_secs);
    }

    /// Fibonacci backoff: 1min, 1min, 2min, 3min, 5min ... capped at 60min.
    pub fn backoff_delay(&self) -> u64 {
        if self.consecutive_failures == 0 {
            return 0;
        }
        let base_unit = 60u64;
        let max_delay = 3600u64;
        fibonacci(self.consecutive_failures - 1)
            .saturating_mul(base_unit)
            .min(max_delay)
    }

    pub fn is_eligible_at(&self, now: u64) -> bool {
        if now < self.parked_until {
            return false;
        }
        if self.last_attempt == 0 {
            return true;
        }
        now.saturating_sub(self.last_attempt) >= self.backoff_delay()
    }
}

/// F(0) = 1, F(1) = 1, F(n) = F(n-1) + F(n-2)
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..=n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

fn normalize(address: &str) -> String {
    address.trim().trim_end_matches('/').to_string()
}

/// Persistent set of sync peers, stored in the `peers` bucket.
#[derive(Clone)]
pub struct PeerRegistry {
    storage: Storage,
    wrong_region_backoff_secs: u64,
}

impl PeerRegistry {
    /// Open the registry and make sure every bootstrap peer is known.
    pub fn new(storage: Storage, settings: &Settings) -> KikiResult<Self> {
        let registry = Self {
            storage,
            wrong_region_backoff_secs: settings.wrong_region_backoff_secs,
        };
        for address in &settings.bootstrap_peers {
            registry.add(address, PeerSource::Bootstrap)?;
        }
        Ok(registry)
    }

    /// Returns true if the address was new.
    pub fn add(&self, address: &str, source: PeerSource) -> KikiResult<bool> {
        let address = normalize(address);
        if address.is_empty() || self.get(&address)?.is_some() {
            return Ok(false);
        }
        self.put(&PeerInfo::new(address.clone(), source))?;
        debug!(%address, ?source, "learned peer");
        Ok(true)
    }

    pub fn get(&self, address: &str) -> KikiResult<Option<PeerInfo>> {
        self.storage.kv_get(buckets::PEERS, &normalize(address))
    }

    pub fn list_all(&self) -> KikiResult<Vec<PeerInfo>> {
        Ok(self
            .storage
            .kv_list::<PeerInfo>(buckets::PEERS)?
            .into_iter()
            .map(|(_, peer)| peer)
            .collect())
    }

    fn put(&self, peer: &PeerInfo) -> KikiResult<()> {
        self.storage.kv_set(buckets::PEERS, &peer.address, peer)
    }

    fn update(&self, address: &str, f: impl FnOnce(&mut PeerInfo)) -> KikiResult<()> {
        let address = normalize(address);
        let mut peer = self
            .get(&address)?
            .unwrap_or_else(|| PeerInfo::new(address.clone(), PeerSource::Manual));
        f(&mut peer);
        self.put(&peer)
    }

    pub fn record_attempt(&self, address: &str) -> KikiResult<()> {
        self.update(address, PeerInfo::record_attempt)
    }

    pub fn record_success(&self, address: &str) -> KikiResult<()> {
        self.update(address, PeerInfo::record_success)
    }

    pub fn record_failure(&self, address: &str) -> KikiResult<()> {
        self.update(address, PeerInfo::record_failure)
    }

    pub fn record_wrong_region(&self, address: &str) -> KikiResult<()> {
        let backoff = self.wrong_region_backoff_secs;
        info!(%address, backoff_secs = backoff, "parking peer from another region");
        self.update(address, |peer| peer.record_wrong_region(backoff))
    }

    /// Pick up peer hints from the projection. Returns how many were new.
    pub fn learn_hints(&self, reader: &FeedReader) -> KikiResult<usize> {
        let mut learned = 0;
        for address in reader.peer_hints()? {
            if self.add(&address, PeerSource::Hint)? {
                learned += 1;
            }
        }
        Ok(learned)
    }

    /// Peers not parked and not backing off.
    pub fn eligible(&self) -> KikiResult<Vec<PeerInfo>> {
        let now = current_timestamp();
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|p| p.is_eligible_at(now))
            .collect())
    }

    /// One eligible peer chosen at random.
    pub fn pick(&self) -> KikiResult<Option<String>> {
        let eligible = self.eligible()?;
        if eligible.is_empty() {
            return Ok(None);
        }
        let index = rand::rng().random_range(0..eligible.len());
        Ok(Some(eligible[index].address.clone()))
    }
}
