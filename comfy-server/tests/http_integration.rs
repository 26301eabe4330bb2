//! HTTP integration tests for the Comfy API
//!
//! Every test runs the full router through `oneshot` against the in-memory
//! store and a wiremock stand-in for the completion provider, so nothing here
//! needs a database or network access.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use comfy_core::{
    ChatStore, ComfyConfig, CompletionConfig, GroqCompletionClient, MemoryChatStore, Role,
};
use comfy_server::http::{build_router, HttpState};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for f in fragments {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": f}}]})
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mock_upstream(template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(template)
        .mount(&server)
        .await;
    server
}

async fn streaming_upstream(fragments: &[&str]) -> MockServer {
    mock_upstream(
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(sse_body(fragments)),
    )
    .await
}

fn make_state(upstream: &MockServer) -> (Arc<MemoryChatStore>, Arc<HttpState>) {
    let config = ComfyConfig::in_memory();
    let client = GroqCompletionClient::with_base_url(
        CompletionConfig {
            api_key: "test-key".to_string(),
            model: config.completion.model.clone(),
            base_url: String::new(),
        },
        upstream.uri(),
    )
    .expect("Failed to create test client");

    let store = Arc::new(MemoryChatStore::new());
    let state = Arc::new(HttpState {
        store: store.clone(),
        completion: Arc::new(client),
        config,
    });
    (store, state)
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ===========================================================================
// POST /api/chat
// ===========================================================================

#[tokio::test]
async fn test_chat_streams_reply_and_sets_headers() {
    let upstream = streaming_upstream(&["Hel", "lo", " there"]).await;
    let (store, state) = make_state(&upstream);

    let response = build_router(state)
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "mood": "Chill",
            "userId": "user_abc"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
    assert_eq!(headers["cache-control"], "no-cache");
    assert_eq!(headers["x-user-id"], "user_abc");
    let session_id: uuid::Uuid = headers["x-session-id"].to_str().unwrap().parse().unwrap();

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"Hello there");

    let messages = store.list_messages(session_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello there");

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.mood, "Chill");
    assert_eq!(session.title, "hi");
}

#[tokio::test]
async fn test_chat_continues_existing_session() {
    let upstream = streaming_upstream(&["ok"]).await;
    let (store, state) = make_state(&upstream);
    let app = build_router(state);

    let first = app
        .clone()
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "one"}],
            "userId": "u1"
        })))
        .await
        .unwrap();
    let session_id = first.headers()["x-session-id"].to_str().unwrap().to_string();
    to_bytes(first.into_body(), usize::MAX).await.unwrap();

    let second = app
        .oneshot(chat_request(json!({
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "two"}
            ],
            "sessionId": session_id,
            "userId": "u1"
        })))
        .await
        .unwrap();
    assert_eq!(second.headers()["x-session-id"], session_id.as_str());
    to_bytes(second.into_body(), usize::MAX).await.unwrap();

    assert_eq!(store.session_count().await, 1);
    let id = session_id.parse().unwrap();
    let contents: Vec<String> = store
        .list_messages(id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["one", "ok", "two", "ok"]);
}

#[tokio::test]
async fn test_chat_without_user_id_is_bad_request() {
    let upstream = streaming_upstream(&["unused"]).await;
    let (store, state) = make_state(&upstream);

    let response = build_router(state)
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "userId required");
    assert_eq!(store.user_count().await, 0);
}

#[tokio::test]
async fn test_upstream_rejection_maps_to_bad_gateway() {
    let upstream = mock_upstream(
        ResponseTemplate::new(429)
            .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
    )
    .await;
    let (store, state) = make_state(&upstream);

    let response = build_router(state)
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "userId": "user_abc"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert_eq!(body["upstream_status"], 429);
    assert_eq!(
        body["error"],
        "Upstream API error: 429. Message: Rate limit reached"
    );

    // The user's turn was committed before the upstream call.
    assert_eq!(store.session_count().await, 1);
}

// ===========================================================================
// History / load / delete
// ===========================================================================

#[tokio::test]
async fn test_history_load_and_delete_round_trip() {
    let upstream = streaming_upstream(&["Nice ", "to meet you"]).await;
    let (_store, state) = make_state(&upstream);
    let app = build_router(state);

    let chat = app
        .clone()
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "Hello!"}],
            "mood": "Curious",
            "userId": "user_round"
        })))
        .await
        .unwrap();
    let session_id = chat.headers()["x-session-id"].to_str().unwrap().to_string();
    to_bytes(chat.into_body(), usize::MAX).await.unwrap();

    let history = app
        .clone()
        .oneshot(get("/api/history?userId=user_round"))
        .await
        .unwrap();
    assert_eq!(history.status(), StatusCode::OK);
    let body = json_body(history).await;
    assert_eq!(body["success"], true);
    let sessions = body["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], session_id.as_str());
    assert_eq!(sessions[0]["title"], "Hello!");
    assert_eq!(sessions[0]["mood"], "Curious");
    assert_eq!(sessions[0]["lastMessage"], "Nice to meet you");

    let load = app
        .clone()
        .oneshot(get(&format!("/api/load-chat?sessionId={}", session_id)))
        .await
        .unwrap();
    assert_eq!(load.status(), StatusCode::OK);
    let body = json_body(load).await;
    assert_eq!(body["mood"], "Curious");
    assert_eq!(
        body["messages"],
        json!([
            {"role": "user", "content": "Hello!"},
            {"role": "assistant", "content": "Nice to meet you"}
        ])
    );

    let delete = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/delete-chat?sessionId={}", session_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete.status(), StatusCode::OK);
    assert_eq!(json_body(delete).await["message"], "Chat deleted");

    let after = app
        .oneshot(get(&format!("/api/load-chat?sessionId={}", session_id)))
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_query_parameter_validation() {
    let upstream = streaming_upstream(&[]).await;
    let (_store, state) = make_state(&upstream);
    let app = build_router(state);

    let history = app.clone().oneshot(get("/api/history")).await.unwrap();
    assert_eq!(history.status(), StatusCode::BAD_REQUEST);

    let load = app
        .clone()
        .oneshot(get("/api/load-chat?sessionId=not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(load.status(), StatusCode::NOT_FOUND);

    let delete = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/delete-chat")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete.status(), StatusCode::BAD_REQUEST);
}

// ===========================================================================
// Health / version
// ===========================================================================

#[tokio::test]
async fn test_health_and_version() {
    let upstream = streaming_upstream(&[]).await;
    let (_store, state) = make_state(&upstream);
    let app = build_router(state);

    let health = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["completion"], "groq");

    let version = app.oneshot(get("/version")).await.unwrap();
    assert_eq!(version.status(), StatusCode::OK);
    assert!(json_body(version).await["version"].is_string());
}
