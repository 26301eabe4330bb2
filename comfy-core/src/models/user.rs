use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub const GUEST_NAME: &'static str = "Guest User";

    /// Synthesized address for users that arrive without an identity provider profile.
    pub fn guest_email(id: &str) -> String {
        format!("{}@comfy.app", id)
    }
}
