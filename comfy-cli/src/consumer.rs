//! Client side of a chat turn: local conversation state, the streamed reply
//! reader, and the registry used to abort requests in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatMessage, ChatPayload, ClientError, ComfyClient, LoadedSession, SessionSummary};
use crate::moods::Mood;

pub const FALLBACK_REPLY: &str = "Oops, something went wrong... try again!";

/// How a send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed(String),
    /// Cancelled by the user; nothing is reported.
    Aborted,
    Failed(String),
    /// Blank input, nothing was sent.
    Skipped,
}

// ============================================================================
// Abort registry
// ============================================================================

/// In-flight requests keyed by name, each with its own cancellation token.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, replacing (and cancelling) any earlier request under it.
    pub fn insert(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            if let Some(previous) = tokens.insert(key.to_string(), token.clone()) {
                previous.cancel();
            }
        }
        token
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(key);
        }
    }

    /// Cancel everything in flight. Returns how many requests were cancelled.
    pub fn abort_all(&self) -> usize {
        match self.tokens.lock() {
            Ok(mut tokens) => {
                let count = tokens.len();
                for (_, token) in tokens.drain() {
                    token.cancel();
                }
                count
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Reply buffer
// ============================================================================

/// Raw reply bytes received so far. Chunk boundaries may split a UTF-8
/// sequence, so only the longest valid prefix is shown until the rest arrives.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    bytes: Vec<u8>,
}

impl ReplyBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> &str {
        self.bytes.extend_from_slice(chunk);
        self.visible()
    }

    pub fn visible(&self) -> &str {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&self.bytes[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    /// Everything received, with any trailing partial sequence replaced.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    pub session_id: Option<String>,
    pub mood: Option<String>,
    pub sessions: Vec<SessionSummary>,
}

impl Conversation {
    /// A fresh chat. Picking a mood seeds its greeting as the first assistant line.
    pub fn new(mood: Option<&Mood>) -> Self {
        let mut conversation = Self::default();
        if let Some(mood) = mood {
            conversation.mood = Some(mood.name.to_string());
            conversation.messages.push(ChatMessage::assistant(mood.greeting));
        }
        conversation
    }

    /// Start over in the same mood.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.session_id = None;
    }

    pub fn adopt_loaded(&mut self, session_id: &str, loaded: LoadedSession) {
        self.session_id = Some(session_id.to_string());
        self.messages = loaded.messages;
        if let Some(mood) = loaded.mood.filter(|m| !m.is_empty()) {
            self.mood = Some(mood);
        }
    }

    /// Replace the session list; failures are logged and leave the old list.
    pub async fn refresh_history(&mut self, client: &ComfyClient, user_id: &str) {
        match client.history(user_id).await {
            Ok(sessions) => self.sessions = sessions,
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "History refresh failed"),
        }
    }

    /// Send one user turn and stream the reply into the conversation.
    ///
    /// `on_text` sees the whole reply so far after every chunk. Cancelling
    /// `cancel` ends the turn silently; any other failure appends
    /// [`FALLBACK_REPLY`] once.
    pub async fn send<F>(
        &mut self,
        client: &ComfyClient,
        user_id: &str,
        text: &str,
        cancel: &CancellationToken,
        mut on_text: F,
    ) -> SendOutcome
    where
        F: FnMut(&str),
    {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Skipped;
        }

        self.messages.push(ChatMessage::user(text));
        let sent_len = self.messages.len();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.stream_reply(client, user_id, &mut on_text) => Some(r),
        };

        match result {
            None => {
                self.drop_empty_placeholder(sent_len);
                tracing::debug!("Send aborted");
                SendOutcome::Aborted
            }
            Some(Ok(reply)) => {
                self.refresh_history(client, user_id).await;
                SendOutcome::Completed(reply)
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Chat request failed");
                self.drop_empty_placeholder(sent_len);
                self.messages.push(ChatMessage::assistant(FALLBACK_REPLY));
                self.refresh_history(client, user_id).await;
                SendOutcome::Failed(e.to_string())
            }
        }
    }

    async fn stream_reply<F>(
        &mut self,
        client: &ComfyClient,
        user_id: &str,
        on_text: &mut F,
    ) -> Result<String, ClientError>
    where
        F: FnMut(&str),
    {
        let mut reply = client
            .open_chat(&ChatPayload {
                messages: &self.messages,
                mood: self.mood.as_deref(),
                session_id: self.session_id.as_deref(),
                user_id,
            })
            .await?;

        if let Some(id) = reply.session_id.take() {
            if self.session_id.as_deref() != Some(id.as_str()) {
                tracing::debug!(
                    session_id = %id,
                    user_id = reply.user_id.as_deref().unwrap_or(user_id),
                    "Adopting session"
                );
                self.session_id = Some(id);
            }
        }

        self.messages.push(ChatMessage::assistant(""));
        let slot = self.messages.len() - 1;
        let mut buffer = ReplyBuffer::default();

        while let Some(chunk) = reply.body.next().await {
            let chunk = chunk?;
            let visible = buffer.push(&chunk);
            self.messages[slot].content = visible.to_string();
            on_text(visible);
        }

        let full = buffer.finish();
        self.messages[slot].content = full.clone();
        Ok(full)
    }

    /// Remove the reply placeholder at `index` if nothing was written into it.
    fn drop_empty_placeholder(&mut self, index: usize) {
        if self
            .messages
            .get(index)
            .is_some_and(|m| m.is_assistant() && m.content.is_empty())
        {
            self.messages.remove(index);
        }
    }
}
