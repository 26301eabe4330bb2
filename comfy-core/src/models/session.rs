use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MOOD: &str = "neutral";
pub const TITLE_MAX_CHARS: usize = 50;

const EMPTY_SEED_TITLE: &str = "New Chat";
const BLANK_TITLE: &str = "Untitled Chat";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub mood: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// One row of a user's history listing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: String,
    pub mood: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
}

/// Title for a new session, seeded from the newest message of the first turn.
///
/// An empty seed becomes "New Chat" before truncation; the seed is cut to
/// [`TITLE_MAX_CHARS`] characters and then trimmed, and a blank result becomes
/// "Untitled Chat".
pub fn derive_title(seed: Option<&str>) -> String {
    let seed = match seed {
        Some(s) if !s.is_empty() => s,
        _ => EMPTY_SEED_TITLE,
    };
    let truncated: String = seed.chars().take(TITLE_MAX_CHARS).collect();
    let trimmed = truncated.trim();
    if trimmed.is_empty() {
        BLANK_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}
