// =============================================================================
// HTTP Intake & Introspection — Axum 0.7
// =============================================================================
//
// POST /webhook        — signal intake (JSON or plain text), 202 on enqueue.
// POST /webhook/test   — parse-only echo, never enqueues.
// GET  /health         — unauthenticated liveness.
// GET  /status         — authenticated engine snapshot.
// GET  /queue          — authenticated queue depth.
//
// Intake never touches a broker: it authenticates, parses, validates and
// enqueues. Dispatch happens asynchronously in the sequencer worker.
// =============================================================================

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth;
use crate::app_state::AppState;
use crate::notify::TradeEvent;
use crate::signal::Signal;

/// Build the full router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Intake ──────────────────────────────────────────────────
        .route("/webhook", post(webhook))
        .route("/webhook/test", post(webhook_test))
        // ── Authenticated introspection & control ───────────────────
        .route("/status", get(status))
        .route("/queue", get(queue))
        .route("/config/reload", post(reload_config))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Intake
// =============================================================================

async fn webhook(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match accept_signal(&state, peer, &query, &headers, &body) {
        Ok(signal) => {
            let request_id = Uuid::new_v4().to_string();
            let position = state.queue.enqueue(request_id.clone(), signal.clone());
            state.record_signal_received();
            info!(
                request_id = %request_id,
                symbol = %signal.symbol,
                side = %signal.side,
                queue_position = position,
                "signal queued"
            );
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "queued",
                    "request_id": request_id,
                    "queue_position": position,
                    "signal": signal,
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
                .into_response()
        }
        Err(response) => {
            state.record_signal_rejected();
            response
        }
    }
}

async fn webhook_test(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match accept_signal(&state, peer, &query, &headers, &body) {
        Ok(signal) => (
            StatusCode::OK,
            Json(json!({
                "status": "parsed",
                "signal": signal,
                "note": "test endpoint, nothing was queued",
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
        Err(response) => response,
    }
}

/// Shared intake path: IP gate, authentication, parse, validate.
fn accept_signal(
    state: &AppState,
    peer: SocketAddr,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &str,
) -> Result<Signal, Response> {
    let config = state.config.get();

    // IP gate runs before anything else.
    if !auth::ip_allowed(peer.ip(), &config.webhook.allowed_ips) {
        warn!(peer = %peer.ip(), "webhook call from blocked address");
        return Err(error_response(StatusCode::FORBIDDEN, "source address not allowed"));
    }

    // The body may carry the secret; parse JSON once and reuse it.
    let json_body: Option<Value> = if is_json_payload(headers, body) {
        match serde_json::from_str(body) {
            Ok(value) => Some(value),
            Err(e) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid JSON payload: {e}"),
                ))
            }
        }
    } else {
        None
    };
    let body_token = json_body.as_ref().and_then(|v| {
        v.get("token")
            .or_else(|| v.get("secret"))
            .and_then(Value::as_str)
    });

    if !auth::secret_matches(&config.webhook.secret, headers, query, body_token) {
        warn!(peer = %peer.ip(), "webhook authentication failed");
        return Err(error_response(StatusCode::UNAUTHORIZED, "invalid or missing token"));
    }

    let parsed = match &json_body {
        Some(value) => Signal::from_json(value),
        None => Signal::from_text(body),
    };
    parsed.map_err(|e| {
        warn!(error = %e, "signal rejected");
        state.events.emit(TradeEvent::EngineError {
            broker: None,
            message: format!("signal rejected at intake: {e}"),
        });
        error_response(StatusCode::BAD_REQUEST, &e.to_string())
    })
}

fn is_json_payload(headers: &HeaderMap, body: &str) -> bool {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    content_type.contains("application/json") || body.trim_start().starts_with('{')
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "error": message }))).into_response()
}

// =============================================================================
// Liveness & introspection
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "queue_depth": state.queue.depth(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_auth(&state, &headers, &query) {
        return response;
    }
    let config = state.config.get();

    let brokers: Vec<Value> = config
        .brokers
        .iter()
        .map(|(id, b)| {
            json!({
                "id": id,
                "name": b.name,
                "type": b.kind.to_string(),
                "enabled": b.enabled,
                "demo": b.is_demo,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "queue": {
            "depth": state.queue.depth(),
            "in_flight": state.queue.in_flight(),
        },
        "signals": {
            "received": state.signals_received.load(std::sync::atomic::Ordering::Relaxed),
            "rejected": state.signals_rejected.load(std::sync::atomic::Ordering::Relaxed),
        },
        "brokers": brokers,
        "recent_events": &*state.recent_events.read(),
        "server_time": Utc::now().timestamp_millis(),
    }))
    .into_response()
}

async fn queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_auth(&state, &headers, &query) {
        return response;
    }
    Json(json!({
        "depth": state.queue.depth(),
        "in_flight": state.queue.in_flight(),
    }))
    .into_response()
}

/// Re-read the config file. The only way account/instrument settings change
/// at runtime.
async fn reload_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_auth(&state, &headers, &query) {
        return response;
    }
    match state.config.reload() {
        Ok(()) => {
            info!("config reloaded via API");
            Json(json!({ "status": "reloaded" })).into_response()
        }
        Err(e) => {
            warn!(error = %e, "config reload failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), Response> {
    let config = state.config.get();
    if auth::secret_matches(&config.webhook.secret, headers, query, None) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid or missing token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::notify::EventBus;
    use crate::sequencer;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TEST_CONFIG: &str = r#"
[webhook]
secret = "sekrit"
"#;

    const BLOCKED_CONFIG: &str = r#"
[webhook]
secret = "sekrit"
allowed_ips = ["10.0.0.1"]
"#;

    fn app_with(config: &str) -> (Router, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, config).unwrap();
        std::mem::forget(dir);

        let store = Arc::new(ConfigStore::load(&path).unwrap());
        let (queue, _rx) = sequencer::channel();
        let state = Arc::new(AppState::new(store, queue, EventBus::new()));
        let app = router(state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))));
        (app, state)
    }

    fn valid_payload() -> String {
        json!({
            "symbol": "EURUSD",
            "side": "LONG",
            "entry": 1.0850,
            "sl": 1.0800,
            "tp": 1.0950
        })
        .to_string()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn webhook_accepts_valid_json() {
        let (app, state) = app_with(TEST_CONFIG);
        let response = app
            .oneshot(
                Request::post("/webhook")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::from(valid_payload()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["queue_position"], 1);
        assert!(body["request_id"].as_str().is_some());
        assert_eq!(body["signal"]["symbol"], "EURUSD");
        assert_eq!(state.queue.depth(), 1);
    }

    #[tokio::test]
    async fn webhook_accepts_body_token_and_text_payload() {
        let (app, _state) = app_with(TEST_CONFIG);

        // Token inside the JSON body.
        let mut payload: Value = serde_json::from_str(&valid_payload()).unwrap();
        payload["token"] = json!("sekrit");
        let response = app
            .clone()
            .oneshot(
                Request::post("/webhook")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // Plain-text alert, token in the query string.
        let text = "LONG EURUSD\nEntry: 1.0850\nSL: 1.0800\nTP: 1.0950\n";
        let response = app
            .oneshot(
                Request::post("/webhook?token=sekrit")
                    .header("content-type", "text/plain")
                    .body(Body::from(text))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn webhook_rejects_bad_auth_and_bad_payloads() {
        let (app, state) = app_with(TEST_CONFIG);

        // Wrong token.
        let response = app
            .clone()
            .oneshot(
                Request::post("/webhook")
                    .header("authorization", "Bearer wrong")
                    .body(Body::from(valid_payload()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Missing field.
        let response = app
            .clone()
            .oneshot(
                Request::post("/webhook")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::from(r#"{"symbol":"EURUSD","side":"LONG"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Invalid levels.
        let response = app
            .oneshot(
                Request::post("/webhook")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::from(
                        json!({
                            "symbol": "EURUSD", "side": "LONG",
                            "entry": 1.0850, "sl": 1.0900, "tp": 1.0950
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(state.queue.depth(), 0);
    }

    #[tokio::test]
    async fn webhook_blocks_disallowed_source_address() {
        let (app, _state) = app_with(BLOCKED_CONFIG);
        let response = app
            .oneshot(
                Request::post("/webhook")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::from(valid_payload()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn webhook_test_parses_without_queueing() {
        let (app, state) = app_with(TEST_CONFIG);
        let response = app
            .oneshot(
                Request::post("/webhook/test")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::from(valid_payload()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "parsed");
        assert_eq!(body["signal"]["side"], "Long");
        assert_eq!(state.queue.depth(), 0);
    }

    #[tokio::test]
    async fn config_reload_requires_auth() {
        let (app, _state) = app_with(TEST_CONFIG);

        let response = app
            .clone()
            .oneshot(
                Request::post("/config/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::post("/config/reload?token=sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_public_but_status_needs_auth() {
        let (app, _state) = app_with(TEST_CONFIG);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::get("/status?token=sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["queue"]["depth"], 0);

        let response = app
            .oneshot(
                Request::get("/queue?token=sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
