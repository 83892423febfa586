//! Per-sender storage quota
//!
//! Foreign senders get `storage_per_public_person` bytes. When a sender goes
//! over, their oldest envelopes are evicted until they fit. Evicted ids are
//! tombstoned so sync does not fetch them again. Tombstones expire after
//! `tombstone_ttl_secs`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{buckets, Feed};
use crate::error::KikiResult;
use crate::storage::Order;

/// What one quota run removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuotaReport {
    pub evicted: Vec<String>,
    pub senders_over_budget: usize,
    /// Expired tombstones dropped
    pub tombstones_pruned: usize,
}

/// Entry in the `evicted` bucket, keyed by envelope id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub sender: String,
    /// Unix seconds
    pub evicted_at: i64,
}

impl Feed {
    /// Evict the oldest envelopes of every sender over budget.
    ///
    /// The local identity and the region key are exempt.
    pub fn enforce_quota(&mut self) -> KikiResult<QuotaReport> {
        let limit = self.ctx.settings.storage_per_public_person;
        let region = self.ctx.region.public().to_string();

        // sender -> [(id, charged bytes)] oldest first
        let mut by_sender: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for stored in self.storage.iter_sealed_by_time(Order::Ascending)? {
            let sender = stored.envelope.sender.public().to_string();
            if self.ctx.is_self(&sender) || sender == region {
                continue;
            }
            let size = if stored.opened {
                match self.storage.get_unsealed(&stored.envelope.id)? {
                    Some(unsealed) => unsealed.letter.data.len() as u64,
                    None => stored.envelope.size() as u64,
                }
            } else {
                stored.envelope.size() as u64
            };
            by_sender
                .entry(sender)
                .or_default()
                .push((stored.envelope.id, size));
        }

        let now = Utc::now().timestamp();
        let mut report = QuotaReport {
            tombstones_pruned: self.prune_tombstones_at(now)?,
            ..QuotaReport::default()
        };
        for (sender, envelopes) in by_sender {
            let mut used: u64 = envelopes.iter().map(|(_, size)| size).sum();
            if used <= limit {
                continue;
            }
            report.senders_over_budget += 1;

            for (id, size) in envelopes {
                if used <= limit {
                    break;
                }
                self.storage.delete_unsealed(&id)?;
                self.storage.delete_sealed(&id)?;
                let tombstone = Tombstone {
                    sender: sender.clone(),
                    evicted_at: now,
                };
                self.storage.kv_set(buckets::EVICTED, &id, &tombstone)?;
                used -= size;
                report.evicted.push(id);
            }
            info!(%sender, used, limit, "evicted envelopes over quota");
        }

        if !report.evicted.is_empty() {
            self.project_pass()?;
        }
        Ok(report)
    }

    /// Forget tombstones older than `tombstone_ttl_secs` as of `now`.
    pub(crate) fn prune_tombstones_at(&self, now: i64) -> KikiResult<usize> {
        let ttl = i64::try_from(self.ctx.settings.tombstone_ttl_secs).unwrap_or(i64::MAX);
        let mut pruned = 0;
        for (id, tombstone) in self.storage.kv_list::<Tombstone>(buckets::EVICTED)? {
            if now.saturating_sub(tombstone.evicted_at) > ttl {
                self.storage.kv_delete(buckets::EVICTED, &id)?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "expired eviction tombstones");
        }
        Ok(pruned)
    }
}
