//! Health & Status API endpoints
//!
//! - GET /health - Liveness
//! - GET /metrics - Prometheus metrics
//! - GET /status - Every status handler as JSON
//! - POST /p2p/message - Inbound envelopes for the HTTP messenger

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::{eyre, Result};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;
use crate::p2p::antiflood::AntiFlood;
use crate::p2p::{HttpEnvelope, HttpMessenger};
use crate::status::{StatusRegistry, StatusSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub status: StatusRegistry,
    /// Absent when peers talk over an in-process hub
    pub messenger: Option<Arc<HttpMessenger>>,
    pub antiflood: Arc<AntiFlood>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<AppState>) -> Json<BTreeMap<String, StatusSnapshot>> {
    Json(state.status.snapshot().await)
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn p2p_message(
    State(state): State<AppState>,
    Json(envelope): Json<HttpEnvelope>,
) -> StatusCode {
    let Some(messenger) = state.messenger.as_ref() else {
        return StatusCode::NOT_FOUND;
    };
    if !messenger.is_known_peer(&envelope.from) {
        metrics::record_p2p_message("http", "unknown_peer");
        return StatusCode::FORBIDDEN;
    }
    if !state.antiflood.allow(&envelope.from) {
        metrics::record_p2p_message("http", "flooded");
        return StatusCode::TOO_MANY_REQUESTS;
    }

    let from = envelope.from.clone();
    match messenger.deliver_inbound(envelope) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            debug!(peer = %from, error = %e, "Rejected envelope");
            StatusCode::BAD_REQUEST
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/p2p/message", post(p2p_message))
        .with_state(state)
}

/// Serve the API until `cancel` fires
pub async fn start_api_server(
    bind_address: &str,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}: {}", bind_address, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    metrics::UP.set(1);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    metrics::UP.set(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{METRIC_NUM_BATCHES, MX_TO_ETH_HANDLER};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(max_per_second: u32) -> (AppState, Arc<HttpMessenger>) {
        let peers = vec![("relayer-b".to_string(), "http://127.0.0.1:9".to_string())];
        let messenger =
            Arc::new(HttpMessenger::new("relayer-a", &peers, Duration::from_secs(1)).unwrap());
        let state = AppState {
            status: StatusRegistry::new(),
            messenger: Some(messenger.clone()),
            antiflood: Arc::new(AntiFlood::new(max_per_second)),
        };
        (state, messenger)
    }

    fn post_envelope(from: &str) -> Request<Body> {
        let envelope = HttpEnvelope::new(from, "join/EthToMultiversX", b"hello");
        Request::builder()
            .method("POST")
            .uri("/p2p/message")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&envelope).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state(10);
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_lists_handlers() {
        let (state, _) = state(10);
        state
            .status
            .handler(MX_TO_ETH_HANDLER)
            .await
            .set_int_metric(METRIC_NUM_BATCHES, 4)
            .await;

        let response = router(state)
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json[MX_TO_ETH_HANDLER]["int_metrics"][METRIC_NUM_BATCHES], 4);
    }

    #[tokio::test]
    async fn test_inbound_envelope_reaches_subscribers() {
        use crate::p2p::NetMessenger;

        let (state, messenger) = state(10);
        let mut inbound = messenger.subscribe();
        let response = router(state).oneshot(post_envelope("relayer-b")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let message = inbound.recv().await.unwrap();
        assert_eq!(message.peer, "relayer-b");
        assert_eq!(message.data, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_unknown_peer_is_forbidden() {
        let (state, _) = state(10);
        let response = router(state).oneshot(post_envelope("stranger")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_flooding_peer_is_throttled() {
        let (state, _) = state(1);
        let app = router(state);
        let first = app.clone().oneshot(post_envelope("relayer-b")).await.unwrap();
        let second = app.oneshot(post_envelope("relayer-b")).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
