//! Kiki Core Library
//!
//! Sealed-envelope protocol and content-addressed feed store for a small
//! federated social network.
//!
//! ## Overview
//!
//! Every piece of content is a [`Letter`] sealed into an [`Envelope`] for an
//! explicit set of recipients. Envelopes are immutable, addressed by the
//! SHA-256 of their sender and sealed content, and gossiped between nodes of
//! one region. Each node opens what it can, and derives its feed (posts,
//! comments, likes, follows, names) as a pure function of the opened set.
//!
//! ## Core Principles
//!
//! - **Sealed by default**: peers store and forward envelopes they cannot read
//! - **Deterministic projection**: same envelopes in, same feed out
//! - **Single writer**: one thread owns the store; readers use snapshots
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiki_core::{setup, ContentKind, Feed, FeedService, Letter, Selector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let setup = setup("~/.kiki".as_ref())?;
//!     let feed = FeedService::spawn(Feed::open(&setup)?)?;
//!
//!     let letter = Letter::new(ContentKind::ShareText, "hello #kiki", "").to(Selector::Public);
//!     feed.process_letter(letter).await?;
//!
//!     for post in feed.reader().show_feed(&Default::default())? {
//!         println!("{}: {}", post.user.name, post.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod feed;
pub mod identity;
pub mod letter;
pub mod settings;
pub mod storage;
pub mod sync;

// Re-exports
pub use crypto::KeyPair;
pub use envelope::{Envelope, UnsealedEnvelope};
pub use error::{KikiError, KikiResult};
pub use feed::{
    ChannelCount, Feed, FeedHandle, FeedParams, FeedReader, FeedService, IngestOutcome, PostView,
    Profile, Projection, QuotaReport, ReconcileReport, User,
};
pub use identity::{default_region, setup, NodeContext, Setup};
pub use letter::{ContentKind, Letter, Selector};
pub use settings::Settings;
pub use storage::Storage;
pub use sync::{
    ApiResponse, HttpTransport, ListResponse, LocalTransport, PeerRegistry, PeerTransport,
    SyncReport, SyncRequest, Synchronizer,
};
