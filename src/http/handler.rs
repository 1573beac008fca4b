//! Main axum router and HTTP request handlers for the cache daemon.
//!
//! Routes:
//! - `GET    /o/{uid}`           - read-through object fetch
//! - `DELETE /o/{uid}`           - explicit invalidation
//! - `POST   /events/write-hash` - backing-store consistency feed
//! - `GET    /fsc/status`        - cache usage and hit-rate snapshot
//! - `GET    /healthz`           - health check
//! - `GET    /metrics`           - Prometheus metrics

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, instrument, warn};

use crate::node::FsNode;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/o/{uid}",
            get(handle_get_object).delete(handle_delete_object),
        )
        .route("/events/write-hash", post(handle_write_hash))
        .route("/fsc/status", get(handle_status))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /o/:uid`
///
/// Serves the object from the cache when possible.  On a miss the object is
/// fetched from the backing store and streamed to the client while a tee'd
/// copy is offered to the cache, so the response is never delayed by
/// caching.
#[instrument(skip(state), fields(%uid))]
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> Result<Response, AppError> {
    validate_path_segment(&uid, "uid")?;

    if let Some(data) = state.cache.try_get(&uid).await {
        return Ok(octet_response(Body::from(data)));
    }

    debug!("cache miss, fetching from upstream store");
    let fetched = state
        .upstream
        .fetch(&uid)
        .await
        .context("fetching object from upstream store")?;

    let Some(fetched) = fetched else {
        return Ok((StatusCode::NOT_FOUND, "object not found").into_response());
    };

    let body = match fetched.size {
        Some(size) => {
            let node = FsNode::new(&uid, size);
            let outcome = state.cache.clone().maybe_store(&node, fetched.stream).await;
            debug!(cached = outcome.cached, size, "read-through fetch");
            Body::from_stream(outcome.stream)
        }
        // Without a declared length the cache cannot pre-size a buffer;
        // pass the stream through uncached.
        None => {
            debug!("upstream sent no content length, passing through uncached");
            Body::from_stream(fetched.stream)
        }
    };

    Ok(octet_response(body))
}

/// `DELETE /o/:uid`
///
/// Operator-facing explicit invalidation.  Idempotent: deleting an
/// untracked object is still a 204.
#[instrument(skip(state), fields(%uid))]
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> Result<Response, AppError> {
    validate_path_segment(&uid, "uid")?;
    state.cache.invalidate(&uid).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// A write-hash change reported by the backing store.
#[derive(Debug, Deserialize)]
struct WriteHashEvent {
    uid: String,
    hash: String,
}

/// `POST /events/write-hash`
///
/// Receives the backing store's consistency signal: the content hash for a
/// key changed.  The cache invalidates the entry when the reported hash
/// differs from the one recorded at ingestion.
#[instrument(skip(state, headers, body))]
async fn handle_write_hash(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if let Err(e) = verify_signature(&state.config.events.webhook_secret_env, &headers, &body) {
        warn!(error = %e, "write-hash signature verification failed");
        return Ok((StatusCode::UNAUTHORIZED, "invalid signature").into_response());
    }

    let event: WriteHashEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid write-hash payload: {e}")))?;

    info!(key = %event.uid, "processing write-hash event");
    state.cache.on_write_hash(&event.uid, &event.hash).await;

    Ok(StatusCode::OK.into_response())
}

/// `GET /fsc/status`
///
/// Read-only introspection: tier usage against capacity and the hit-rate
/// estimate.  No mutation capability.
async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cache.status().await)
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        config: Arc::clone(&state.config),
        http_client: state.http_client.clone(),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the daemon.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn octet_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

/// Reject path segments that could escape the cache directory when used as
/// a filename.
pub(crate) fn validate_path_segment(segment: &str, label: &str) -> Result<(), AppError> {
    if segment.is_empty() {
        return Err(AppError::BadRequest(format!("{label} must not be empty")));
    }
    if segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0')
        || segment == "."
        || segment == ".."
    {
        return Err(AppError::BadRequest(format!(
            "invalid {label}: {segment:?}"
        )));
    }
    Ok(())
}

/// Verify the HMAC-SHA256 signature on a write-hash event body.
///
/// When the secret environment variable is unset the feed is accepted
/// unsigned; once a secret is configured, a valid `X-Webhook-Signature`
/// header is required.
fn verify_signature(secret_env: &str, headers: &HeaderMap, body: &Bytes) -> anyhow::Result<()> {
    let secret = match std::env::var(secret_env) {
        Ok(secret) => secret,
        Err(_) => {
            debug!("no webhook secret configured, accepting unsigned event");
            return Ok(());
        }
    };

    let sig_header = headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("missing X-Webhook-Signature header"))?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow::anyhow!("X-Webhook-Signature does not start with sha256="))?;

    let sig_bytes =
        hex::decode(sig_hex).map_err(|e| anyhow::anyhow!("invalid hex in signature: {e}"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
    mac.update(body);

    mac.verify_slice(&sig_bytes)
        .map_err(|_| anyhow::anyhow!("HMAC signature mismatch"))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request itself is malformed.
    BadRequest(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── validate_path_segment ──────────────────────────────────────────

    #[test]
    fn plain_uid_is_accepted() {
        assert!(validate_path_segment("b7bcba1e-38e9-4a9a", "uid").is_ok());
    }

    #[test]
    fn empty_segment_is_rejected() {
        assert!(validate_path_segment("", "uid").is_err());
    }

    #[test]
    fn traversal_attempts_are_rejected() {
        assert!(validate_path_segment("..", "uid").is_err());
        assert!(validate_path_segment(".", "uid").is_err());
        assert!(validate_path_segment("a/b", "uid").is_err());
        assert!(validate_path_segment("a\\b", "uid").is_err());
        assert!(validate_path_segment("a\0b", "uid").is_err());
    }

    // ── write-hash payload ─────────────────────────────────────────────

    #[test]
    fn write_hash_event_parses() {
        let event: WriteHashEvent =
            serde_json::from_slice(br#"{"uid":"abc","hash":"deadbeef"}"#).unwrap();
        assert_eq!(event.uid, "abc");
        assert_eq!(event.hash, "deadbeef");
    }

    // ── signature verification ─────────────────────────────────────────

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn unsigned_events_pass_without_a_secret() {
        let headers = HeaderMap::new();
        let body = Bytes::from_static(b"{}");
        assert!(verify_signature("BLOBCACHE_TEST_SECRET_UNSET", &headers, &body).is_ok());
    }

    #[test]
    fn valid_signature_is_accepted() {
        std::env::set_var("BLOBCACHE_TEST_SECRET_VALID", "s3cret");
        let body = Bytes::from_static(br#"{"uid":"abc","hash":"h"}"#);
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Webhook-Signature",
            sign("s3cret", &body).parse().unwrap(),
        );
        assert!(verify_signature("BLOBCACHE_TEST_SECRET_VALID", &headers, &body).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        std::env::set_var("BLOBCACHE_TEST_SECRET_TAMPER", "s3cret");
        let body = Bytes::from_static(br#"{"uid":"abc","hash":"h"}"#);
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Webhook-Signature",
            sign("s3cret", b"something else").parse().unwrap(),
        );
        assert!(verify_signature("BLOBCACHE_TEST_SECRET_TAMPER", &headers, &body).is_err());
    }

    #[test]
    fn missing_signature_is_rejected_when_secret_is_set() {
        std::env::set_var("BLOBCACHE_TEST_SECRET_MISSING", "s3cret");
        let headers = HeaderMap::new();
        let body = Bytes::from_static(b"{}");
        assert!(verify_signature("BLOBCACHE_TEST_SECRET_MISSING", &headers, &body).is_err());
    }
}
