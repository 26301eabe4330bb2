//! Comfy HTTP API
//!
//! Axum server for the chat client. Each endpoint has a thin axum handler that
//! delegates to an inner function; the inner functions are directly testable
//! without axum dispatch machinery.
//!
//! Endpoints:
//! - POST   /api/chat         streamed chat turn (plain-text body)
//! - GET    /api/history      a user's sessions, most recent first
//! - GET    /api/load-chat    one session's mood and messages
//! - DELETE /api/delete-chat  delete a session and its messages
//! - GET    /health           store health
//! - GET    /version          server version info

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use comfy_core::api::{ChatMessageDto, ChatRequest, SessionQuery, SessionSummaryDto, UserQuery};
use comfy_core::{ChatStore, ComfyConfig, CompletionBackend, CompletionError};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::subsystems::relay::{start_relay, RelayError, RelayStart};

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn ChatStore>,
    pub completion: Arc<dyn CompletionBackend>,
    pub config: ComfyConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/history", get(history_handler))
        .route("/api/load-chat", get(load_chat_handler))
        .route("/api/delete-chat", delete(delete_chat_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: HttpState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Comfy HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    pub fn body(msg: impl Into<String>) -> serde_json::Value {
        serde_json::json!(Self::new(msg))
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner chat: validates, persists the user turn and opens the upstream stream.
/// On success the caller owns the streaming body.
pub async fn chat_inner(
    state: &HttpState,
    req: ChatRequest,
) -> std::result::Result<RelayStart, (StatusCode, serde_json::Value)> {
    start_relay(
        state.store.clone(),
        state.completion.clone(),
        &state.config.completion,
        req,
    )
    .await
    .map_err(|e| relay_error_to_http(&e, &state.config.completion.api_key_env))
}

/// Session summaries for a user, most recent first.
pub async fn history_inner(
    store: &dyn ChatStore,
    user_id: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let user_id = match user_id.filter(|u| !u.trim().is_empty()) {
        Some(u) => u,
        None => return (StatusCode::BAD_REQUEST, ErrorResponse::body("userId required")),
    };

    match store.list_session_summaries(&user_id).await {
        Ok(summaries) => {
            let sessions: Vec<SessionSummaryDto> =
                summaries.into_iter().map(SessionSummaryDto::from).collect();
            (
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "sessions": sessions,
                }),
            )
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "History lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(e.to_string()))
        }
    }
}

/// Mood and ordered messages of one session.
pub async fn load_session_inner(
    store: &dyn ChatStore,
    session_id: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let raw = match session_id.filter(|s| !s.trim().is_empty()) {
        Some(s) => s,
        None => return (StatusCode::BAD_REQUEST, ErrorResponse::body("sessionId required")),
    };
    let id = match Uuid::parse_str(&raw) {
        Ok(id) => id,
        Err(_) => return (StatusCode::NOT_FOUND, ErrorResponse::body("Session not found")),
    };

    let session = match store.get_session(id).await {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::NOT_FOUND, ErrorResponse::body("Session not found")),
        Err(e) => {
            tracing::error!(session_id = %id, error = %e, "Load session failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(e.to_string()));
        }
    };

    match store.list_messages(id).await {
        Ok(messages) => {
            let messages: Vec<ChatMessageDto> = messages.iter().map(ChatMessageDto::from).collect();
            (
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "mood": session.mood,
                    "messages": messages,
                }),
            )
        }
        Err(e) => {
            tracing::error!(session_id = %id, error = %e, "Load messages failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(e.to_string()))
        }
    }
}

/// Removes a session; its messages go with it.
pub async fn delete_session_inner(
    store: &dyn ChatStore,
    session_id: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let raw = match session_id.filter(|s| !s.trim().is_empty()) {
        Some(s) => s,
        None => return (StatusCode::BAD_REQUEST, ErrorResponse::body("sessionId required")),
    };
    let id = match Uuid::parse_str(&raw) {
        Ok(id) => id,
        Err(_) => return (StatusCode::NOT_FOUND, ErrorResponse::body("Session not found")),
    };

    match store.delete_session(id).await {
        Ok(true) => {
            tracing::info!(session_id = %id, "Deleted chat session");
            (
                StatusCode::OK,
                serde_json::json!({
                    "success": true,
                    "message": "Chat deleted",
                }),
            )
        }
        Ok(false) => (StatusCode::NOT_FOUND, ErrorResponse::body("Session not found")),
        Err(e) => {
            tracing::error!(session_id = %id, error = %e, "Delete session failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(e.to_string()))
        }
    }
}

/// Probes the store and reports the completion model.
pub async fn health_inner(
    store: &dyn ChatStore,
    completion: &dyn CompletionBackend,
) -> (StatusCode, serde_json::Value) {
    match store.health().await {
        Ok(detail) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": store.name(),
                "store_detail": detail,
                "completion": completion.name(),
                "model": completion.model(),
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "store": store.name(),
                "error": e.to_string(),
            }),
        ),
    }
}

/// Version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "comfy/1",
    })
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> Response {
    match chat_inner(&state, req).await {
        Ok(start) => streaming_response(start),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

pub async fn history_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let (status, body) = history_inner(state.store.as_ref(), query.user_id).await;
    (status, Json(body))
}

pub async fn load_chat_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let (status, body) = load_session_inner(state.store.as_ref(), query.session_id).await;
    (status, Json(body))
}

pub async fn delete_chat_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let (status, body) = delete_session_inner(state.store.as_ref(), query.session_id).await;
    (status, Json(body))
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.store.as_ref(), state.completion.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

// ============================================================================
// Helpers
// ============================================================================

/// Map a pre-stream relay failure onto a status code and JSON error body.
pub fn relay_error_to_http(err: &RelayError, api_key_env: &str) -> (StatusCode, serde_json::Value) {
    match err {
        RelayError::MissingUserId => (StatusCode::BAD_REQUEST, ErrorResponse::body("userId required")),
        RelayError::Persistence(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::body("Internal server error"),
        ),
        RelayError::Completion(CompletionError::MissingApiKey) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::body(format!("Missing {}", api_key_env)),
        ),
        RelayError::Completion(CompletionError::Api { code, .. }) => (
            StatusCode::BAD_GATEWAY,
            serde_json::json!({
                "error": err.to_string(),
                "status": "error",
                "upstream_status": code,
            }),
        ),
        RelayError::Completion(e) => (
            StatusCode::BAD_GATEWAY,
            ErrorResponse::body(format!("Upstream API unavailable: {}", e)),
        ),
    }
}

/// Plain-text streamed body plus the resolved ids as headers.
pub fn streaming_response(start: RelayStart) -> Response {
    let mut response = Response::new(Body::from_stream(start.body));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(v) = HeaderValue::from_str(&start.session_id.to_string()) {
        headers.insert(SESSION_ID_HEADER, v);
    }
    match HeaderValue::from_str(&start.user_id) {
        Ok(v) => {
            headers.insert(USER_ID_HEADER, v);
        }
        Err(_) => {
            tracing::warn!(user_id = %start.user_id, "User id is not a valid header value");
        }
    }
    response
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
