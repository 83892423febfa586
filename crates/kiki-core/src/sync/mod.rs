//! Envelope synchronization between nodes of one region
//!
//! Sync is pull based: ask a peer for its id list, download what is missing
//! and hand each envelope to the feed writer. Optionally the envelopes the
//! peer lacks are pushed back afterwards.
//!
//! ```text
//! ┌──────────┐  GET /list         ┌──────────┐
//! │  local   │ ─────────────────▶ │   peer   │
//! │          │  GET /download/:id │          │
//! │  feed    │ ─────────────────▶ │          │
//! │  writer  │  POST /envelope    │          │
//! │          │ ─────────────────▶ │          │
//! └──────────┘                    └──────────┘
//! ```

use serde::{Deserialize, Serialize};

pub mod peers;
pub mod puller;
pub mod transport;

pub use peers::{PeerInfo, PeerRegistry, PeerSource, PeerStatus};
pub use puller::{SyncReport, Synchronizer};
pub use transport::{HttpTransport, LocalTransport, PeerTransport};

/// Body of `GET /list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub ids: Vec<String>,
    pub region_key: String,
}

/// Generic `{success, message}` reply used by `/ping`, `/envelope` and
/// `/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub address: String,
}
