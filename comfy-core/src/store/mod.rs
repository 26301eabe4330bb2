//! Persistence gateway for users, chat sessions and messages.
//!
//! The `ChatStore` trait is the only surface the server talks to. Two backends:
//! - **postgres**: `PgChatStore` over a sqlx pool
//! - **memory**: `MemoryChatStore`, process-local, for development and tests

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::ComfyError;
use crate::models::{ChatSession, Message, Role, SessionSummary, User};

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;

/// Fields for a session about to be created; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub title: String,
    pub mood: String,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_user(&self, id: &str) -> Result<Option<User>, ComfyError>;

    /// Insert the user unless a row with this id already exists, then return the stored row.
    async fn get_or_create_user(
        &self,
        id: &str,
        name: &str,
        email: &str,
    ) -> Result<User, ComfyError>;

    /// Session lookup constrained to its owner. A session owned by someone else is `None`.
    async fn find_session(&self, id: Uuid, user_id: &str)
        -> Result<Option<ChatSession>, ComfyError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>, ComfyError>;

    async fn create_session(&self, new: NewSession) -> Result<ChatSession, ComfyError>;

    /// Set the session's last-activity timestamp.
    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ComfyError>;

    /// Delete a session and its messages. Returns `false` when nothing matched.
    async fn delete_session(&self, id: Uuid) -> Result<bool, ComfyError>;

    async fn create_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Message, ComfyError>;

    /// Messages of a session in creation order.
    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, ComfyError>;

    /// A user's sessions, most recent activity first.
    async fn list_session_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionSummary>, ComfyError>;

    /// Backend description for the health endpoint.
    async fn health(&self) -> Result<String, ComfyError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Build the configured store. Postgres pools get the schema applied before use.
pub async fn create_store(config: &DatabaseConfig) -> Result<Arc<dyn ChatStore>, ComfyError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryChatStore::new())),
        "postgres" => {
            let pool = crate::db::create_pool(config).await?;
            crate::db::apply_schema(&pool).await?;
            Ok(Arc::new(PgChatStore::new(pool)))
        }
        other => Err(ComfyError::Other(format!(
            "unknown database backend '{}' (expected 'postgres' or 'memory')",
            other
        ))),
    }
}
