//! How a node reaches its peers
//!
//! [`PeerTransport`] is the seam between the synchronizer and the network.
//! [`HttpTransport`] talks to the HTTP surface of a running node;
//! [`LocalTransport`] routes to feed handles in the same process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use tracing::debug;

use super::{ApiResponse, ListResponse};
use crate::envelope::Envelope;
use crate::error::{KikiError, KikiResult};
use crate::feed::{FeedHandle, IngestOutcome};

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ids the peer serves, plus its region key.
    async fn list(&self, peer: &str) -> KikiResult<ListResponse>;

    async fn download(&self, peer: &str, id: &str) -> KikiResult<Envelope>;

    async fn upload(&self, peer: &str, envelope: &Envelope) -> KikiResult<ApiResponse>;
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> KikiResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// `host:port` or a full base URL.
    fn url(peer: &str, path: &str) -> String {
        let base = peer.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}{path}")
        } else {
            format!("http://{base}{path}")
        }
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn list(&self, peer: &str) -> KikiResult<ListResponse> {
        let response = self
            .client
            .get(Self::url(peer, "/list"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn download(&self, peer: &str, id: &str) -> KikiResult<Envelope> {
        let response = self
            .client
            .get(Self::url(peer, &format!("/download/{id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(KikiError::NotFound(format!("envelope {id} on {peer}")));
        }
        let body = response.error_for_status()?.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| KikiError::Corrupt(format!("envelope {id} from {peer}: {e}")))
    }

    async fn upload(&self, peer: &str, envelope: &Envelope) -> KikiResult<ApiResponse> {
        let response = self
            .client
            .post(Self::url(peer, "/envelope"))
            .json(envelope)
            .send()
            .await?;
        let status = response.status();
        // error bodies still carry {success, message}
        let reply: ApiResponse = response
            .json()
            .await
            .unwrap_or_else(|_| ApiResponse::error(status.to_string()));
        debug!(%peer, envelope = %envelope.id, %status, "uploaded envelope");
        Ok(reply)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-process
// ═══════════════════════════════════════════════════════════════════════════

/// Routes peer addresses to feed handles living in this process.
#[derive(Clone, Default)]
pub struct LocalTransport {
    nodes: Arc<RwLock<BTreeMap<String, FeedHandle>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, handle: FeedHandle) {
        self.nodes.write().insert(address.into(), handle);
    }

    fn node(&self, peer: &str) -> KikiResult<FeedHandle> {
        self.nodes
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| KikiError::Network(format!("no route to {peer}")))
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn list(&self, peer: &str) -> KikiResult<ListResponse> {
        let node = self.node(peer)?;
        let reader = node.reader();
        Ok(ListResponse {
            ids: reader.list_ids()?.into_iter().collect(),
            region_key: reader.region_public().to_string(),
        })
    }

    async fn download(&self, peer: &str, id: &str) -> KikiResult<Envelope> {
        self.node(peer)?
            .reader()
            .get_envelope(id)?
            .ok_or_else(|| KikiError::NotFound(format!("envelope {id} on {peer}")))
    }

    async fn upload(&self, peer: &str, envelope: &Envelope) -> KikiResult<ApiResponse> {
        let node = self.node(peer)?;
        match node.ingest_envelope(envelope.clone()).await {
            Ok(IngestOutcome::Stored { .. }) => Ok(ApiResponse::ok("stored")),
            Ok(outcome) => Ok(ApiResponse::ok(format!("{outcome:?}"))),
            Err(e) => Ok(ApiResponse::error(e.to_string())),
        }
    }
}
