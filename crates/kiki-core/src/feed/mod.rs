//! Feed engine - the single writer over the store
//!
//! The feed ingests locally authored letters and envelopes from peers, runs
//! the unseal pass, and rebuilds the projection. Every mutating method takes
//! `&mut self`; [`FeedService`] moves the feed onto a dedicated thread so
//! there is exactly one writer per node.
//!
//! # Pipeline
//!
//! ```text
//! Letter ─seal─▶ Envelope ─put_sealed─▶ unseal_pass ─▶ project_pass ─▶ enforce_quota
//!                   ▲
//! peer ─────────────┘ (ingest_envelope)
//! ```
//!
//! Unsealing may reveal new friend keys, which may open envelopes that were
//! unreadable before, so the unseal and project passes repeat until the key
//! set stops growing.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crypto::KeyPair;
use crate::envelope::Envelope;
use crate::error::{KikiError, KikiResult};
use crate::identity::{NodeContext, Setup};
use crate::letter::{ContentKind, Letter, Selector};
use crate::storage::{Order, PutOutcome, Storage};

pub mod projection;
pub mod query;
mod quota;
pub mod service;

pub use projection::{buckets, PostRecord, Projection, SealedSummary, PEER_CHANNEL_PREFIX};
pub use query::{ChannelCount, FeedParams, FeedReader, PostView, Profile, User};
pub use quota::{QuotaReport, Tombstone};
pub use service::{FeedHandle, FeedService};

/// What happened to an envelope offered by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// New envelope stored; `opened` if this node could read it
    Stored { opened: bool },
    AlreadyPresent,
    /// Previously evicted by the quota
    Evicted,
    /// Belongs to another region; dropped
    OutOfRegion,
}

/// Counters from one unseal pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnsealStats {
    pub attempted: usize,
    pub opened: usize,
    pub failed: usize,
}

/// Counters from [`Feed::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub purged: usize,
    pub opened: usize,
    pub evicted: usize,
}

pub struct Feed {
    ctx: NodeContext,
    storage: Storage,
}

impl Feed {
    pub fn new(ctx: NodeContext, storage: Storage) -> Self {
        Self { ctx, storage }
    }

    /// Open the database named by `setup`.
    pub fn open(setup: &Setup) -> KikiResult<Self> {
        let storage = Storage::new(&setup.database_path)?;
        Ok(Self::new(setup.context.clone(), storage))
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Read-only view over committed state.
    pub fn reader(&self) -> FeedReader {
        FeedReader::new(self.storage.clone(), self.ctx.clone())
    }

    fn viewer(&self) -> &str {
        self.ctx.identity.public()
    }

    fn friend_keys(&self, bucket: &str) -> KikiResult<Vec<KeyPair>> {
        Ok(self
            .storage
            .kv_get(bucket, self.ctx.identity.public())?
            .unwrap_or_default())
    }

    /// Keys tried on every envelope: identity, region, friend keys received,
    /// friend keys handed out.
    pub fn candidate_keys(&self) -> KikiResult<Vec<KeyPair>> {
        let mut keys = vec![self.ctx.identity.clone(), self.ctx.region.clone()];
        keys.extend(self.friend_keys(buckets::FRIEND_KEYS_FROM)?);
        keys.extend(self.friend_keys(buckets::FRIEND_KEYS_FOR)?);
        Ok(keys)
    }

    fn blocked(&self) -> KikiResult<BTreeSet<String>> {
        Ok(self
            .storage
            .kv_get(buckets::BLOCKS, self.viewer())?
            .unwrap_or_default())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Authoring
    // ═══════════════════════════════════════════════════════════════════════

    /// Seal and store a letter authored by this node.
    ///
    /// Returns once the projection reflecting the letter is durable.
    pub fn process_letter(&mut self, mut letter: Letter) -> KikiResult<Envelope> {
        let viewer = self.viewer().to_string();
        letter.stamp(&viewer);
        letter.validate(self.ctx.settings.max_letter_bytes)?;

        match letter.content_kind {
            ContentKind::AssignFollow => match letter.literal_target() {
                None => {
                    return Err(KikiError::InvalidLetter(
                        "assign-follow needs a public key in `to`".into(),
                    ))
                }
                Some(target) if self.ctx.is_self(target) => {
                    return Err(KikiError::InvalidLetter("cannot follow yourself".into()))
                }
                Some(_) => {}
            },
            ContentKind::ActionBlock if self.ctx.is_self(letter.data.trim()) => {
                return Err(KikiError::InvalidLetter("cannot block yourself".into()));
            }
            _ => {}
        }

        if letter.content_kind.is_public_action() && !letter.to.contains(&Selector::Public) {
            letter.to.push(Selector::Public);
        }

        if letter.is_edit() && letter.content_kind.is_post() {
            let original: PostRecord = self
                .storage
                .kv_get(buckets::POSTS, &letter.first_id)?
                .ok_or_else(|| KikiError::NotFound(format!("post {}", letter.first_id)))?;
            if !self.ctx.is_self(&original.author) {
                return Err(KikiError::InvalidOperation(
                    "cannot edit a letter authored by someone else".into(),
                ));
            }
            letter.reply_to = original.reply_to;
        }

        let friend_keys_for = self.friend_keys(buckets::FRIEND_KEYS_FOR)?;
        let envelope = Envelope::seal(
            &letter,
            &self.ctx.identity,
            &self.ctx.region,
            &friend_keys_for,
            &[],
        )?;
        self.storage.put_sealed(&envelope)?;

        self.settle()?;
        self.enforce_quota()?;

        info!(
            envelope = %envelope.id,
            letter = %letter.id,
            kind = %letter.content_kind,
            "processed letter"
        );
        Ok(envelope)
    }

    /// Mint a fresh friend key and mail it to ourselves.
    ///
    /// Until this has happened once, `friends` expands to nobody.
    pub fn add_friends_key(&mut self) -> KikiResult<KeyPair> {
        let key = KeyPair::generate()?;
        let letter = Letter::new(
            ContentKind::ShareKey,
            serde_json::to_string(&key)?,
            self.viewer(),
        );
        self.process_letter(letter)?;
        info!(friend_key = %key.public(), "added friends key");
        Ok(key)
    }

    /// Mail the newest friend key to every mutual follow that lacks it.
    ///
    /// Returns the number of friends mailed.
    pub fn share_friends_key(&mut self) -> KikiResult<usize> {
        let viewer = self.viewer().to_string();
        let mut projection = Projection::load(&self.storage, &viewer)?;
        let key = match projection.friend_keys_for.last() {
            Some(key) => key.clone(),
            None => {
                self.add_friends_key()?;
                projection = Projection::load(&self.storage, &viewer)?;
                projection
                    .friend_keys_for
                    .last()
                    .cloned()
                    .ok_or_else(|| KikiError::InvalidOperation("friend key did not project".into()))?
            }
        };
        let payload = serde_json::to_string(&key)?;

        let mut mailed = 0;
        for friend in projection.friends_of(&viewer) {
            let already = projection
                .friend_keys_sent
                .get(&friend)
                .is_some_and(|sent| sent.contains(key.public()));
            if already {
                continue;
            }
            let letter = Letter::new(ContentKind::ShareKey, payload.clone(), &viewer)
                .to(Selector::Literal(friend.clone()));
            self.process_letter(letter)?;
            mailed += 1;
        }
        if mailed > 0 {
            info!(mailed, friend_key = %key.public(), "shared friends key");
        }
        Ok(mailed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ingest
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept an envelope from a peer.
    ///
    /// Corrupt envelopes, including letters whose id does not hash from
    /// their sender, and envelopes from blocked senders are rejected with an
    /// error and never stored. Envelopes that are merely unwanted (foreign
    /// region, evicted) are dropped and reported through the outcome.
    pub fn ingest_envelope(&mut self, envelope: Envelope) -> KikiResult<IngestOutcome> {
        if !envelope.verify_id() {
            return Err(KikiError::Corrupt(format!("id mismatch for {}", envelope.id)));
        }
        if !envelope.signature.is_empty() && !envelope.attestation_valid(&self.ctx.region) {
            // a tampered attestation from our own region, or one from elsewhere
            if !envelope.validated_for_region(&self.ctx.region, &self.ctx.identity) {
                return Ok(IngestOutcome::OutOfRegion);
            }
            return Err(KikiError::Corrupt(format!(
                "region attestation does not match {}",
                envelope.id
            )));
        }
        if self
            .storage
            .kv_get::<Tombstone>(buckets::EVICTED, &envelope.id)?
            .is_some()
        {
            return Ok(IngestOutcome::Evicted);
        }
        if self.blocked()?.contains(envelope.sender.public()) {
            debug!(envelope = %envelope.id, sender = %envelope.sender.public(), "refusing blocked sender");
            return Err(KikiError::Blocked(envelope.sender.public().to_string()));
        }
        if !envelope.validated_for_region(&self.ctx.region, &self.ctx.identity) {
            debug!(envelope = %envelope.id, "dropping envelope from another region");
            return Ok(IngestOutcome::OutOfRegion);
        }

        if self.storage.get_sealed(&envelope.id)?.is_some() {
            return Ok(IngestOutcome::AlreadyPresent);
        }

        let sender = envelope.sender.public();
        let size = envelope.size() as u64;
        let limit = self.ctx.settings.storage_per_public_person;
        if size > limit && !self.ctx.is_self(sender) && sender != self.ctx.region.public() {
            return Err(KikiError::QuotaExceeded {
                sender: sender.to_string(),
                size,
                limit,
            });
        }

        let unsealed = match envelope.unseal(&self.candidate_keys()?, &self.ctx.region) {
            Ok(unsealed) => Some(unsealed),
            Err(KikiError::NotRecipient) => None,
            Err(e) => {
                warn!(envelope = %envelope.id, error = %e, "refusing envelope that does not unseal");
                return Err(e);
            }
        };

        if self.storage.put_sealed(&envelope)? == PutOutcome::AlreadyPresent {
            return Ok(IngestOutcome::AlreadyPresent);
        }
        match unsealed {
            Some(unsealed) => {
                self.storage.put_unsealed(&unsealed)?;
                self.settle()?;
                debug!(envelope = %envelope.id, kind = %unsealed.letter.content_kind, "ingested and opened");
                Ok(IngestOutcome::Stored { opened: true })
            }
            None => {
                self.charge_storage(envelope.sender.public(), envelope.size() as u64)?;
                debug!(envelope = %envelope.id, "ingested sealed");
                Ok(IngestOutcome::Stored { opened: false })
            }
        }
    }

    /// Incremental form of the `storage_used` projection for an envelope
    /// that did not open.
    fn charge_storage(&self, sender: &str, size: u64) -> KikiResult<()> {
        let used: u64 = self
            .storage
            .kv_get(buckets::STORAGE_USED, sender)?
            .unwrap_or(0);
        self.storage.kv_set(buckets::STORAGE_USED, sender, &(used + size))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Passes
    // ═══════════════════════════════════════════════════════════════════════

    /// Try to open every sealed envelope that has not been opened yet.
    ///
    /// Not being a recipient is expected and silent. Other failures are
    /// logged per envelope and never abort the pass.
    pub fn unseal_pass(&mut self) -> KikiResult<UnsealStats> {
        let keys = self.candidate_keys()?;
        let mut stats = UnsealStats::default();

        for id in self.storage.unopened_ids()? {
            let Some(stored) = self.storage.get_sealed(&id)? else {
                continue;
            };
            stats.attempted += 1;
            match stored.envelope.unseal(&keys, &self.ctx.region) {
                Ok(unsealed) => {
                    self.storage.put_unsealed(&unsealed)?;
                    stats.opened += 1;
                }
                Err(KikiError::NotRecipient) => {}
                Err(e) => {
                    stats.failed += 1;
                    debug!(envelope = %id, error = %e, "unseal failed");
                }
            }
        }

        if stats.opened > 0 || stats.failed > 0 {
            info!(
                attempted = stats.attempted,
                opened = stats.opened,
                failed = stats.failed,
                "unseal pass"
            );
        }
        Ok(stats)
    }

    /// Rebuild every derived bucket from the envelope catalog.
    pub fn project_pass(&mut self) -> KikiResult<Projection> {
        let sealed: Vec<SealedSummary> = self
            .storage
            .iter_sealed_by_time(Order::Ascending)?
            .into_iter()
            .map(|s| SealedSummary {
                size: s.envelope.size() as u64,
                sender: s.envelope.sender.public().to_string(),
                id: s.envelope.id,
            })
            .collect();
        let unsealed = self.storage.iter_unsealed_by_time(Order::Ascending)?;

        let projection = Projection::build(self.viewer(), &sealed, &unsealed);
        self.storage
            .kv_replace_buckets(&projection.to_buckets(self.viewer())?)?;

        debug!(
            posts = projection.posts.len(),
            unsealed = unsealed.len(),
            sealed = sealed.len(),
            "projection rebuilt"
        );
        Ok(projection)
    }

    /// Unseal and project until no new keys appear.
    fn settle(&mut self) -> KikiResult<UnsealStats> {
        let mut total = UnsealStats::default();
        loop {
            let before: BTreeSet<String> = self
                .candidate_keys()?
                .iter()
                .map(|k| k.public().to_string())
                .collect();

            let stats = self.unseal_pass()?;
            total.attempted += stats.attempted;
            total.opened += stats.opened;
            total.failed += stats.failed;
            self.project_pass()?;

            let grew = self
                .candidate_keys()?
                .iter()
                .any(|k| !before.contains(k.public()));
            if !grew {
                return Ok(total);
            }
        }
    }

    /// Remove everything sent by senders this node blocks.
    fn purge_blocked(&mut self) -> KikiResult<usize> {
        let blocked = self.blocked()?;
        if blocked.is_empty() {
            return Ok(0);
        }
        let mut purged = 0;
        for stored in self.storage.iter_sealed_by_time(Order::Ascending)? {
            if blocked.contains(stored.envelope.sender.public()) {
                self.storage.delete_unsealed(&stored.envelope.id)?;
                self.storage.delete_sealed(&stored.envelope.id)?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "purged envelopes from blocked senders");
        }
        Ok(purged)
    }

    /// Bring derived state in line with the envelopes on disk.
    pub fn reconcile(&mut self) -> KikiResult<ReconcileReport> {
        let stats = self.settle()?;
        let purged = self.purge_blocked()?;
        if purged > 0 {
            self.project_pass()?;
        }
        let quota = self.enforce_quota()?;

        let report = ReconcileReport {
            purged,
            opened: stats.opened,
            evicted: quota.evicted.len(),
        };
        info!(
            purged = report.purged,
            opened = report.opened,
            evicted = report.evicted,
            sealed = self.storage.sealed_count()?,
            "reconciled feed"
        );
        Ok(report)
    }
}
