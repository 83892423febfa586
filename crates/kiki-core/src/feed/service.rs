//! Single-writer feed service
//!
//! [`FeedService::spawn`] moves a [`Feed`] onto its own OS thread. All
//! mutations travel to it over a channel and are applied one at a time, so
//! projections never observe a sealed envelope without its consequences.
//! Reads go straight to the store through a [`FeedReader`] and never wait on
//! the writer.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{Feed, FeedReader, IngestOutcome, QuotaReport, ReconcileReport};
use crate::crypto::KeyPair;
use crate::envelope::Envelope;
use crate::error::{KikiError, KikiResult};
use crate::letter::Letter;

/// Default capacity for the command channel
const COMMAND_CHANNEL_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<KikiResult<T>>;

/// Mutations handled by the writer thread
enum FeedCommand {
    ProcessLetter(Box<Letter>, Reply<Envelope>),
    IngestEnvelope(Box<Envelope>, Reply<IngestOutcome>),
    Reconcile(Reply<ReconcileReport>),
    EnforceQuota(Reply<QuotaReport>),
    AddFriendsKey(Reply<KeyPair>),
    ShareFriendsKey(Reply<usize>),
}

pub struct FeedService;

impl FeedService {
    /// Start the writer thread. It exits once every handle is dropped.
    pub fn spawn(mut feed: Feed) -> KikiResult<FeedHandle> {
        let (tx, mut rx) = mpsc::channel::<FeedCommand>(COMMAND_CHANNEL_CAPACITY);
        let reader = feed.reader();

        std::thread::Builder::new()
            .name("kiki-feed-writer".into())
            .spawn(move || {
                info!(identity = %feed.context().identity.public(), "feed writer started");
                while let Some(command) = rx.blocking_recv() {
                    // a dropped reply receiver means the caller gave up; nothing to do
                    match command {
                        FeedCommand::ProcessLetter(letter, reply) => {
                            let _ = reply.send(feed.process_letter(*letter));
                        }
                        FeedCommand::IngestEnvelope(envelope, reply) => {
                            let _ = reply.send(feed.ingest_envelope(*envelope));
                        }
                        FeedCommand::Reconcile(reply) => {
                            let _ = reply.send(feed.reconcile());
                        }
                        FeedCommand::EnforceQuota(reply) => {
                            let _ = reply.send(feed.enforce_quota());
                        }
                        FeedCommand::AddFriendsKey(reply) => {
                            let _ = reply.send(feed.add_friends_key());
                        }
                        FeedCommand::ShareFriendsKey(reply) => {
                            let _ = reply.send(feed.share_friends_key());
                        }
                    }
                }
                debug!("feed writer stopped");
            })?;

        Ok(FeedHandle { tx, reader })
    }
}

/// Cloneable handle to the writer thread plus a reader.
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<FeedCommand>,
    reader: FeedReader,
}

fn writer_gone() -> KikiError {
    KikiError::InvalidOperation("feed writer is not running".into())
}

impl FeedHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> FeedCommand,
    ) -> KikiResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| writer_gone())?;
        reply_rx.await.map_err(|_| writer_gone())?
    }

    pub fn reader(&self) -> &FeedReader {
        &self.reader
    }

    pub async fn process_letter(&self, letter: Letter) -> KikiResult<Envelope> {
        self.request(|r| FeedCommand::ProcessLetter(Box::new(letter), r))
            .await
    }

    pub async fn ingest_envelope(&self, envelope: Envelope) -> KikiResult<IngestOutcome> {
        self.request(|r| FeedCommand::IngestEnvelope(Box::new(envelope), r))
            .await
    }

    pub async fn reconcile(&self) -> KikiResult<ReconcileReport> {
        self.request(FeedCommand::Reconcile).await
    }

    pub async fn enforce_quota(&self) -> KikiResult<QuotaReport> {
        self.request(FeedCommand::EnforceQuota).await
    }

    pub async fn add_friends_key(&self) -> KikiResult<KeyPair> {
        self.request(FeedCommand::AddFriendsKey).await
    }

    pub async fn share_friends_key(&self) -> KikiResult<usize> {
        self.request(FeedCommand::ShareFriendsKey).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::test_feed;
    use crate::feed::FeedParams;
    use crate::letter::{ContentKind, Selector};

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (feed, _dir) = test_feed();
        let handle = FeedService::spawn(feed).unwrap();

        let letter = Letter::new(ContentKind::ShareText, "via service", "").to(Selector::Public);
        let envelope = handle.process_letter(letter).await.unwrap();

        assert!(handle.reader().list_ids().unwrap().contains(&envelope.id));
        let posts = handle.reader().show_feed(&FeedParams::default()).unwrap();
        assert_eq!(posts[0].content, "via service");

        assert_eq!(
            handle.ingest_envelope(envelope).await.unwrap(),
            IngestOutcome::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let (feed, _dir) = test_feed();
        let handle = FeedService::spawn(feed).unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let letter = Letter::new(ContentKind::ShareText, format!("post {i}"), "")
                    .to(Selector::Public);
                handle.process_letter(letter).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(handle.reader().list_ids().unwrap().len(), 8);
        let report = handle.reconcile().await.unwrap();
        assert_eq!(report.evicted, 0);
    }

    #[tokio::test]
    async fn test_errors_come_back_to_caller() {
        let (feed, _dir) = test_feed();
        let handle = FeedService::spawn(feed).unwrap();
        let bad = Letter::new(ContentKind::parse("share-gif"), "x", "");
        assert!(matches!(
            handle.process_letter(bad).await,
            Err(KikiError::InvalidKind(_))
        ));
    }
}
