//! HTTP surface of a node
//!
//! Peer-facing routes (`/list`, `/download/:id`, `/envelope`) are open to
//! anyone. `/letter` and `/sync` act as the local identity and only answer
//! loopback callers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, head, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use kiki_core::{
    ApiResponse, ChannelCount, Envelope, FeedHandle, FeedParams, FeedReader, IngestOutcome,
    KikiError, KikiResult, Letter, ListResponse, PostView, Profile, SyncReport, SyncRequest,
    Synchronizer, User,
};

/// Largest request body accepted. Letters are capped separately by
/// `max_letter_bytes`.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub feed: FeedHandle,
    pub sync: Arc<Synchronizer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", head(liveness))
        .route("/ping", get(ping))
        // Peer sync
        .route("/list", get(list))
        .route("/download/:id", get(download))
        .route("/envelope", post(envelope))
        // Local identity only
        .route("/letter", post(letter))
        .route("/sync", post(sync))
        // Read API
        .route("/img/:id", get(image))
        .route("/api/posts", get(api_posts))
        .route("/api/post/:id", get(api_post))
        .route("/api/post/:id/comments", get(api_comments))
        .route("/api/user", get(api_me))
        .route("/api/user/:id", get(api_user))
        .route("/api/profile/:id", get(api_profile))
        .route("/api/channels", get(api_channels))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Error response: `{success: false, message}` with a mapped status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "only available from localhost".into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<KikiError> for ApiError {
    fn from(err: KikiError) -> Self {
        let status = match &err {
            KikiError::NotFound(_) => StatusCode::NOT_FOUND,
            KikiError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            KikiError::WrongRegion { .. } => StatusCode::CONFLICT,
            KikiError::Corrupt(_)
            | KikiError::NotRecipient
            | KikiError::Auth
            | KikiError::NotOwner
            | KikiError::InvalidKind(_)
            | KikiError::InvalidLetter(_)
            | KikiError::InvalidKey(_)
            | KikiError::Blocked(_)
            | KikiError::Serialization(_)
            | KikiError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::error(self.message))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn is_local(addr: &SocketAddr) -> bool {
    addr.ip().to_canonical().is_loopback()
}

/// Run a store read off the async runtime.
async fn read<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&FeedReader) -> KikiResult<T> + Send + 'static,
{
    let reader = state.feed.reader().clone();
    tokio::task::spawn_blocking(move || f(&reader))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(ApiError::from)
}

// ═══════════════════════════════════════════════════════════════════════════
// Peer routes
// ═══════════════════════════════════════════════════════════════════════════

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn ping(State(state): State<AppState>) -> Json<ApiResponse> {
    Json(ApiResponse::ok(state.feed.reader().region_public()))
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<ListResponse>> {
    let region_key = state.feed.reader().region_public().to_string();
    let ids = read(&state, |r| r.list_ids()).await?;
    Ok(Json(ListResponse {
        ids: ids.into_iter().collect(),
        region_key,
    }))
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope>> {
    let lookup = id.clone();
    read(&state, move |r| r.get_envelope(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| KikiError::NotFound(format!("envelope {id}")).into())
}

async fn envelope(
    State(state): State<AppState>,
    Json(envelope): Json<Envelope>,
) -> ApiResult<Json<ApiResponse>> {
    let id = envelope.id.clone();
    let outcome = state.feed.ingest_envelope(envelope).await?;
    debug!(envelope = %id, ?outcome, "envelope received");
    let reply = match outcome {
        IngestOutcome::Stored { .. } => ApiResponse::ok("stored"),
        IngestOutcome::AlreadyPresent => ApiResponse::ok("already present"),
        IngestOutcome::Evicted => ApiResponse::error("evicted"),
        IngestOutcome::OutOfRegion => ApiResponse::error("wrong region"),
    };
    Ok(Json(reply))
}

// ═══════════════════════════════════════════════════════════════════════════
// Local routes
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct LetterResponse {
    success: bool,
    envelope_id: String,
}

async fn letter(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Json(letter): Json<Letter>,
) -> ApiResult<Json<LetterResponse>> {
    if !is_local(&addr) {
        return Err(ApiError::forbidden());
    }
    let envelope = state.feed.process_letter(letter).await?;
    Ok(Json(LetterResponse {
        success: true,
        envelope_id: envelope.id,
    }))
}

async fn sync(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<SyncReport>> {
    if !is_local(&addr) {
        return Err(ApiError::forbidden());
    }
    Ok(Json(state.sync.pull(&request.address).await?))
}

// ═══════════════════════════════════════════════════════════════════════════
// Read API
// ═══════════════════════════════════════════════════════════════════════════

async fn image(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let (mime, bytes) = read(&state, move |r| r.image_bytes(&id)).await?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

async fn api_posts(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> ApiResult<Json<Vec<PostView>>> {
    Ok(Json(read(&state, move |r| r.list_posts_for_api(&params)).await?))
}

async fn api_post(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<PostView>> {
    Ok(Json(read(&state, move |r| r.get_post_for_api(&id)).await?))
}

async fn api_comments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PostView>>> {
    Ok(Json(
        read(&state, move |r| r.get_post_comments_for_api(&id)).await?,
    ))
}

async fn api_me(State(state): State<AppState>) -> ApiResult<Json<User>> {
    Ok(Json(read(&state, |r| r.me()).await?))
}

async fn api_user(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<User>> {
    Ok(Json(read(&state, move |r| r.get_user_for_api(&id)).await?))
}

async fn api_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(read(&state, move |r| r.show_profile(&id)).await?))
}

async fn api_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<ChannelCount>>> {
    Ok(Json(read(&state, |r| r.list_channels()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    use kiki_core::{
        default_region, ContentKind, Feed, FeedService, HttpTransport, KeyPair, NodeContext,
        Selector, Settings, Storage,
    };
    use tempfile::TempDir;

    struct TestNode {
        base: String,
        address: String,
        feed: FeedHandle,
        _dir: TempDir,
    }

    fn node_state(region: &KeyPair) -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("kiki.redb")).unwrap();
        let settings = Settings::default();
        let ctx = NodeContext::new(KeyPair::generate().unwrap(), region.clone(), settings.clone());
        let feed = FeedService::spawn(Feed::new(ctx, storage)).unwrap();
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let sync = Synchronizer::new(feed.clone(), Arc::new(transport), &settings).unwrap();
        (
            AppState {
                feed,
                sync: Arc::new(sync),
            },
            dir,
        )
    }

    async fn serve(region: &KeyPair) -> TestNode {
        let (state, dir) = node_state(region);
        let feed = state.feed.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        TestNode {
            base: format!("http://{address}"),
            address,
            feed,
            _dir: dir,
        }
    }

    fn text_json(data: &str) -> serde_json::Value {
        serde_json::json!({
            "content_kind": "share-text",
            "data": data,
            "to": ["public"],
        })
    }

    #[test]
    fn test_is_local() {
        assert!(is_local(&SocketAddr::from((Ipv4Addr::LOCALHOST, 1))));
        assert!(is_local(&SocketAddr::from((Ipv6Addr::LOCALHOST, 1))));
        assert!(is_local(&SocketAddr::from((
            Ipv4Addr::LOCALHOST.to_ipv6_mapped(),
            1
        ))));
        assert!(!is_local(&SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 1))));
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: KikiError| ApiError::from(e).status;
        assert_eq!(status(KikiError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(KikiError::QuotaExceeded {
                sender: "x".into(),
                size: 2,
                limit: 1
            }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status(KikiError::WrongRegion {
                expected: "a".into(),
                found: "b".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status(KikiError::InvalidKind("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(KikiError::Corrupt("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(KikiError::Network("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_letter_then_peer_routes() {
        let node = serve(&default_region()).await;
        let client = reqwest::Client::new();

        let live = client.head(format!("{}/", node.base)).send().await.unwrap();
        assert_eq!(live.status(), 200);

        let posted: serde_json::Value = client
            .post(format!("{}/letter", node.base))
            .json(&text_json("over http"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(posted["success"], true);
        let envelope_id = posted["envelope_id"].as_str().unwrap().to_string();

        let listing: ListResponse = client
            .get(format!("{}/list", node.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing.ids, vec![envelope_id.clone()]);
        assert_eq!(listing.region_key, default_region().public());

        let ping: ApiResponse = client
            .get(format!("{}/ping", node.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ping.message, default_region().public());

        let envelope: Envelope = client
            .get(format!("{}/download/{envelope_id}", node.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(envelope.verify_id());

        let missing = client
            .get(format!("{}/download/nope", node.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let posts: Vec<PostView> = client
            .get(format!("{}/api/posts", node.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content, "over http");
    }

    #[tokio::test]
    async fn test_bad_letters_rejected() {
        let node = serve(&default_region()).await;
        let client = reqwest::Client::new();

        let unknown = client
            .post(format!("{}/letter", node.base))
            .json(&serde_json::json!({"content_kind": "share-gif", "data": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 400);

        let big = client
            .post(format!("{}/letter", node.base))
            .json(&text_json(&"x".repeat(3 * 1024 * 1024)))
            .send()
            .await
            .unwrap();
        assert_eq!(big.status(), 400);
        let reply: ApiResponse = big.json().await.unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("exceeds limit"));

        assert!(node.feed.reader().list_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_over_http() {
        let region = default_region();
        let a = serve(&region).await;
        let b = serve(&region).await;

        b.feed
            .process_letter(
                Letter::new(ContentKind::ShareText, "served by b", "").to(Selector::Public),
            )
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let report: SyncReport = client
            .post(format!("{}/sync", a.base))
            .json(&SyncRequest {
                address: b.address.clone(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(
            a.feed.reader().list_ids().unwrap(),
            b.feed.reader().list_ids().unwrap()
        );
    }

    #[tokio::test]
    async fn test_sync_wrong_region_is_conflict() {
        let a = serve(&default_region()).await;
        let b = serve(&KeyPair::generate().unwrap()).await;

        let response = reqwest::Client::new()
            .post(format!("{}/sync", a.base))
            .json(&SyncRequest {
                address: b.address.clone(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
    }
}
