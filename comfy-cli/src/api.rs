//! HTTP calls against the Comfy server.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Timeout for the short JSON calls. Chat streams are bounded only at connect.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload<'a> {
    pub messages: &'a [ChatMessage],
    pub mood: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub user_id: &'a str,
}

/// An accepted chat turn: ids from the response headers plus the raw body.
pub struct ChatReply {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub mood: String,
    #[serde(default)]
    pub last_message: String,
    /// Epoch milliseconds of the last activity.
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadedSession {
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: Client,
    base: String,
}

impl ComfyClient {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// POST /api/chat. Succeeds once the response headers arrive; the body is
    /// read by the caller.
    pub async fn open_chat(&self, payload: &ChatPayload<'_>) -> Result<ChatReply, ClientError> {
        let resp = self
            .http
            .post(format!("{}/api/chat", self.base))
            .json(payload)
            .send()
            .await?;
        let resp = check(resp).await?;

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let session_id = header(SESSION_ID_HEADER);
        let user_id = header(USER_ID_HEADER);

        Ok(ChatReply {
            session_id,
            user_id,
            body: resp.bytes_stream().boxed(),
        })
    }

    /// GET /api/history
    pub async fn history(&self, user_id: &str) -> Result<Vec<SessionSummary>, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/history", self.base))
            .query(&[("userId", user_id)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let body: HistoryResponse = check(resp).await?.json().await?;
        Ok(body.sessions)
    }

    /// GET /api/load-chat
    pub async fn load_session(&self, session_id: &str) -> Result<LoadedSession, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/load-chat", self.base))
            .query(&[("sessionId", session_id)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    /// DELETE /api/delete-chat
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(format!("{}/api/delete-chat", self.base))
            .query(&[("sessionId", session_id)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    /// GET /health
    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }
}

async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}
