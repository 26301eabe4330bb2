//! Chat relay: persist the user's turn, stream the upstream reply to the
//! caller fragment by fragment, and commit the assistant's turn once.
//!
//! Per request the relay moves through
//! `Resolving → PersistUserMessage → Streaming → Finalizing → Done`
//! (or `Failed` from any phase before the body starts).
//!
//! Two stages run inside the spawned body task:
//! - [`forward_fragments`] reads upstream events, accumulates text and writes
//!   each fragment to the response channel in arrival order.
//! - [`finalize_turn`] persists the accumulated text as the assistant message
//!   and bumps the session's last-activity time.
//!
//! They are joined by [`RelayContext::finalize`], which holds the one-shot
//! latch: end of data, the `[DONE]` token, an upstream read error and a
//! disconnected client all lead there, and only the first call does anything.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use comfy_core::api::{ChatMessageDto, ChatRequest};
use comfy_core::config::CompletionSettings;
use comfy_core::models::DEFAULT_MOOD;
use comfy_core::{
    ChatStore, ComfyError, CompletionBackend, CompletionError, CompletionRequest, FragmentStream,
    PromptMessage, Role, UpstreamEvent,
};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::resolver::resolve_session;

/// Chunks written to the HTTP response body.
pub type BodyChunk = Result<Bytes, io::Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Resolving,
    PersistUserMessage,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("userId is required")]
    MissingUserId,

    #[error("Persistence error: {0}")]
    Persistence(#[from] ComfyError),

    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// What ended the streaming phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTrigger {
    /// The upstream sent its termination token.
    Done,
    /// The upstream body ended without one.
    EndOfData,
    /// Reading the upstream failed.
    UpstreamError,
    /// The response channel is closed; the caller went away.
    ClientGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Persisted { message_id: Uuid },
    SkippedEmpty,
    Failed(String),
}

/// One-shot guard around end-of-stream persistence.
#[derive(Debug, Default)]
pub struct FinalizeLatch {
    fired: bool,
}

impl FinalizeLatch {
    /// `true` the first time only.
    pub fn try_fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Request-scoped relay state. Lives in the body task; nothing is shared.
#[derive(Debug)]
pub struct RelayContext {
    pub session_id: Uuid,
    accumulated: String,
    fragments: usize,
    latch: FinalizeLatch,
    finalizations: u32,
}

impl RelayContext {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            accumulated: String::new(),
            fragments: 0,
            latch: FinalizeLatch::default(),
            finalizations: 0,
        }
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Number of times finalization logic actually ran.
    pub fn finalizations(&self) -> u32 {
        self.finalizations
    }

    fn push_fragment(&mut self, text: &str) {
        self.accumulated.push_str(text);
        self.fragments += 1;
    }

    /// Run the finalize stage unless it already ran. Persistence failures are
    /// logged and reported in the outcome, never raised: the caller has
    /// already received every byte.
    pub async fn finalize(
        &mut self,
        store: &dyn ChatStore,
        trigger: FinalizeTrigger,
    ) -> Option<FinalizeOutcome> {
        if !self.latch.try_fire() {
            tracing::debug!(session_id = %self.session_id, ?trigger, "Finalize already ran");
            return None;
        }
        self.finalizations += 1;
        tracing::debug!(session_id = %self.session_id, ?trigger, phase = ?RelayPhase::Finalizing);

        let outcome = match finalize_turn(store, self.session_id, &self.accumulated).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to persist assistant reply"
                );
                FinalizeOutcome::Failed(e.to_string())
            }
        };

        if let FinalizeOutcome::Persisted { message_id } = &outcome {
            tracing::info!(
                session_id = %self.session_id,
                message_id = %message_id,
                chars = self.accumulated.chars().count(),
                ?trigger,
                "Saved assistant reply"
            );
        }
        Some(outcome)
    }
}

/// Summary of one finished relay, returned by the body task.
#[derive(Debug)]
pub struct RelayReport {
    pub trigger: FinalizeTrigger,
    pub outcome: Option<FinalizeOutcome>,
    pub context: RelayContext,
}

/// What the HTTP layer needs to answer a chat request.
pub struct RelayStart {
    pub session_id: Uuid,
    pub user_id: String,
    pub body: ReceiverStream<BodyChunk>,
    pub task: tokio::task::JoinHandle<RelayReport>,
}

// ============================================================================
// Prompt assembly
// ============================================================================

pub fn system_prompt(mood: &str) -> String {
    format!(
        "You are Comfy, a warm, caring, emotional AI friend. User mood: {mood}. \
         Match your tone to that mood. You are a clean, structured chatbot.\n\
         ALWAYS format your responses using:\n\
         - Short paragraphs\n\
         - Bullet points\n\
         - Headings\n\
         - Code blocks for code."
    )
}

/// System instruction followed by the newest `history_window` messages, oldest first.
pub fn build_completion_request(
    settings: &CompletionSettings,
    mood: &str,
    messages: &[ChatMessageDto],
) -> CompletionRequest {
    let start = messages.len().saturating_sub(settings.history_window);
    let mut prompt = Vec::with_capacity(messages.len() - start + 1);
    prompt.push(PromptMessage::new(Role::System, system_prompt(mood)));
    prompt.extend(
        messages[start..]
            .iter()
            .map(|m| PromptMessage::new(m.role, m.content.clone())),
    );

    CompletionRequest {
        messages: prompt,
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Forward upstream fragments to `sink` in arrival order, accumulating them in `ctx`.
pub async fn forward_fragments(
    ctx: &mut RelayContext,
    fragments: &mut FragmentStream,
    sink: &mpsc::Sender<BodyChunk>,
) -> FinalizeTrigger {
    loop {
        match fragments.next().await {
            Some(Ok(UpstreamEvent::Fragment(text))) => {
                if text.is_empty() {
                    continue;
                }
                ctx.push_fragment(&text);
                if sink.send(Ok(Bytes::from(text))).await.is_err() {
                    tracing::info!(session_id = %ctx.session_id, "Client disconnected mid-stream");
                    return FinalizeTrigger::ClientGone;
                }
            }
            Some(Ok(UpstreamEvent::Done)) => return FinalizeTrigger::Done,
            Some(Err(e)) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "Upstream stream error");
                return FinalizeTrigger::UpstreamError;
            }
            None => return FinalizeTrigger::EndOfData,
        }
    }
}

/// Persist a finished reply. Blank text leaves both the message table and
/// the session's last-activity time untouched.
pub async fn finalize_turn(
    store: &dyn ChatStore,
    session_id: Uuid,
    text: &str,
) -> Result<FinalizeOutcome, ComfyError> {
    if text.trim().is_empty() {
        return Ok(FinalizeOutcome::SkippedEmpty);
    }
    let message = store
        .create_message(session_id, Role::Assistant, text)
        .await?;
    store.touch_session(session_id, Utc::now()).await?;
    Ok(FinalizeOutcome::Persisted {
        message_id: message.id,
    })
}

/// Body task: forward, then finalize once, then close the channel by dropping it.
pub async fn run_relay(
    mut ctx: RelayContext,
    store: Arc<dyn ChatStore>,
    mut fragments: FragmentStream,
    sink: mpsc::Sender<BodyChunk>,
) -> RelayReport {
    let trigger = forward_fragments(&mut ctx, &mut fragments, &sink).await;
    drop(fragments);
    let outcome = ctx.finalize(store.as_ref(), trigger).await;
    drop(sink);
    tracing::debug!(
        session_id = %ctx.session_id,
        fragments = ctx.fragments(),
        phase = ?RelayPhase::Done
    );
    RelayReport {
        trigger,
        outcome,
        context: ctx,
    }
}

// ============================================================================
// Entry point
// ============================================================================

fn failed(phase: RelayPhase, err: impl Into<RelayError>) -> RelayError {
    let err = err.into();
    tracing::warn!(?phase, error = %err, next = ?RelayPhase::Failed, "Chat relay failed");
    err
}

/// Resolve, persist the user's message, open the upstream stream and spawn the
/// body task. Errors returned here happen before any body byte is produced.
pub async fn start_relay(
    store: Arc<dyn ChatStore>,
    completion: Arc<dyn CompletionBackend>,
    settings: &CompletionSettings,
    request: ChatRequest,
) -> Result<RelayStart, RelayError> {
    let user_id = request
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(RelayError::MissingUserId)?
        .to_string();
    let last = request.messages.last();

    tracing::debug!(
        user_id = %user_id,
        messages = request.messages.len(),
        phase = ?RelayPhase::Resolving
    );
    let resolved = resolve_session(
        store.as_ref(),
        &user_id,
        request.session_id.as_deref(),
        last.map(|m| m.content.as_str()),
        request.mood.as_deref(),
    )
    .await
    .map_err(|e| failed(RelayPhase::Resolving, e))?;
    let session_id = resolved.session.id;

    tracing::debug!(session_id = %session_id, phase = ?RelayPhase::PersistUserMessage);
    if let Some(last) = last {
        store
            .create_message(session_id, Role::User, &last.content)
            .await
            .map_err(|e| failed(RelayPhase::PersistUserMessage, e))?;
    }

    tracing::debug!(session_id = %session_id, phase = ?RelayPhase::Streaming);
    let stored_mood = resolved.session.mood.as_str();
    let mood = request
        .mood
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or(if stored_mood.is_empty() {
            DEFAULT_MOOD
        } else {
            stored_mood
        });
    let completion_request = build_completion_request(settings, mood, &request.messages);
    let fragments = completion
        .stream_chat(&completion_request)
        .await
        .map_err(|e| failed(RelayPhase::Streaming, e))?;

    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(run_relay(
        RelayContext::new(session_id),
        store,
        fragments,
        tx,
    ));

    Ok(RelayStart {
        session_id,
        user_id: resolved.user.id,
        body: ReceiverStream::new(rx),
        task,
    })
}

// ============================================================================
// Tests
// ============================================================================
