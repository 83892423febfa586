//! Pull-based synchronizer
//!
//! Network I/O happens here, outside the feed writer. Only the per-envelope
//! `ingest_envelope` call goes through the writer, so a slow peer never
//! blocks local authoring.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::peers::{PeerRegistry, PeerSource};
use super::transport::PeerTransport;
use crate::error::{KikiError, KikiResult};
use crate::feed::{FeedHandle, IngestOutcome};
use crate::settings::Settings;

/// Counters from one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub peer: String,
    /// Ids the peer offered
    pub listed: usize,
    /// Ids we did not have and had not evicted
    pub missing: usize,
    pub ingested: usize,
    pub opened: usize,
    /// Downloaded but refused: blocked sender, over budget, evicted, other
    /// region, or already present
    pub skipped: usize,
    pub failed: usize,
    pub evicted: usize,
    pub pushed: usize,
}

pub struct Synchronizer {
    feed: FeedHandle,
    transport: Arc<dyn PeerTransport>,
    peers: PeerRegistry,
    parallelism: usize,
    push_on_sync: bool,
    interval: Duration,
}

impl Synchronizer {
    pub fn new(
        feed: FeedHandle,
        transport: Arc<dyn PeerTransport>,
        settings: &Settings,
    ) -> KikiResult<Self> {
        let peers = PeerRegistry::new(feed.reader().storage().clone(), settings)?;
        Ok(Self {
            feed,
            transport,
            peers,
            parallelism: settings.sync_parallelism.max(1),
            push_on_sync: settings.push_on_sync,
            interval: Duration::from_secs(settings.sync_interval_secs.max(1)),
        })
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Fetch everything `peer` has that we lack, then optionally push back
    /// what it lacks.
    ///
    /// Fails with `WrongRegion` before touching the store if the peer serves
    /// a different region. Per-envelope failures are logged and counted.
    pub async fn pull(&self, peer: &str) -> KikiResult<SyncReport> {
        self.peers.add(peer, PeerSource::Manual)?;
        self.peers.record_attempt(peer)?;

        let listing = match self.transport.list(peer).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(%peer, error = %e, "listing peer failed");
                self.peers.record_failure(peer)?;
                return Err(e);
            }
        };

        let reader = self.feed.reader();
        if listing.region_key != reader.region_public() {
            self.peers.record_wrong_region(peer)?;
            return Err(KikiError::WrongRegion {
                expected: reader.region_public().to_string(),
                found: listing.region_key,
            });
        }

        let local = reader.list_ids()?;
        let mut missing = Vec::new();
        for id in &listing.ids {
            if !local.contains(id) && !reader.is_evicted(id)? {
                missing.push(id.clone());
            }
        }

        let mut report = SyncReport {
            peer: peer.to_string(),
            listed: listing.ids.len(),
            missing: missing.len(),
            ..SyncReport::default()
        };

        let transport = &self.transport;
        let mut downloads = stream::iter(missing)
            .map(|id| async move {
                let result = transport.download(peer, &id).await;
                (id, result)
            })
            .buffer_unordered(self.parallelism);

        while let Some((id, result)) = downloads.next().await {
            let envelope = match result {
                Ok(envelope) if envelope.id == id => envelope,
                Ok(envelope) => {
                    warn!(%peer, requested = %id, served = %envelope.id, "peer served the wrong envelope");
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!(%peer, envelope = %id, error = %e, "download failed");
                    report.failed += 1;
                    continue;
                }
            };
            match self.feed.ingest_envelope(envelope).await {
                Ok(IngestOutcome::Stored { opened }) => {
                    report.ingested += 1;
                    if opened {
                        report.opened += 1;
                    }
                }
                Ok(outcome) => {
                    debug!(%peer, envelope = %id, ?outcome, "envelope skipped");
                    report.skipped += 1;
                }
                Err(e @ (KikiError::Blocked(_) | KikiError::QuotaExceeded { .. })) => {
                    debug!(%peer, envelope = %id, reason = %e, "envelope refused");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(%peer, envelope = %id, error = %e, "ingest failed");
                    report.failed += 1;
                }
            }
        }
        drop(downloads);

        report.evicted = self.feed.enforce_quota().await?.evicted.len();

        if self.push_on_sync {
            let remote: BTreeSet<String> = listing.ids.into_iter().collect();
            report.pushed = self.push(peer, &remote).await?;
        }

        self.peers.record_success(peer)?;
        self.peers.learn_hints(reader)?;
        info!(
            %peer,
            listed = report.listed,
            ingested = report.ingested,
            opened = report.opened,
            failed = report.failed,
            pushed = report.pushed,
            "sync complete"
        );
        Ok(report)
    }

    /// Upload local envelopes the peer did not list.
    async fn push(&self, peer: &str, remote: &BTreeSet<String>) -> KikiResult<usize> {
        let reader = self.feed.reader();
        let mut outgoing = Vec::new();
        for id in reader.list_ids()?.difference(remote) {
            if let Some(envelope) = reader.get_envelope(id)? {
                outgoing.push(envelope);
            }
        }

        let transport = &self.transport;
        let pushed = stream::iter(outgoing)
            .map(|envelope| async move {
                match transport.upload(peer, &envelope).await {
                    Ok(reply) if reply.success => true,
                    Ok(reply) => {
                        debug!(%peer, envelope = %envelope.id, message = %reply.message, "peer refused envelope");
                        false
                    }
                    Err(e) => {
                        warn!(%peer, envelope = %envelope.id, error = %e, "upload failed");
                        false
                    }
                }
            })
            .buffer_unordered(self.parallelism)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        Ok(pushed)
    }

    /// Pull from one eligible peer, if there is one.
    pub async fn sync_once(&self) -> KikiResult<Option<SyncReport>> {
        self.peers.learn_hints(self.feed.reader())?;
        let Some(peer) = self.peers.pick()? else {
            debug!("no eligible peers");
            return Ok(None);
        };
        self.pull(&peer).await.map(Some)
    }

    /// Sync on every tick of `sync_interval_secs`, forever. The first tick
    /// fires immediately.
    pub async fn run_periodic(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sync_once().await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => debug!(error = %e, "sync tick failed"),
                Err(e) => warn!(error = %e, "sync tick failed"),
            }
            // new mutual follows may have arrived
            if let Err(e) = self.feed.share_friends_key().await {
                warn!(error = %e, "sharing friends key failed");
            }
        }
    }
}
