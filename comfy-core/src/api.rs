//! JSON shapes shared by the HTTP endpoints.

use serde::{Deserialize, Serialize};

use crate::models::{Message, Role, SessionSummary};

/// One entry of the conversation the client sends with each turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageDto {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ChatMessageDto {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessageDto>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// History row as the client sees it; `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummaryDto {
    pub id: String,
    pub title: String,
    pub mood: String,
    pub last_message: String,
    pub timestamp: i64,
}

impl From<SessionSummary> for SessionSummaryDto {
    fn from(s: SessionSummary) -> Self {
        Self {
            id: s.id.to_string(),
            title: s.title,
            mood: s.mood,
            last_message: s.last_message,
            timestamp: s.last_message_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn test_chat_request_accepts_camel_case_and_nulls() {
        let req: ChatRequest = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
            "mood": null,
            "sessionId": null,
            "userId": "user_abc"
        }))
        .unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
        assert!(req.session_id.is_none());
        assert_eq!(req.user_id.as_deref(), Some("user_abc"));
    }

    #[test]
    fn test_summary_timestamp_is_epoch_millis() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let dto = SessionSummaryDto::from(SessionSummary {
            id: Uuid::nil(),
            title: "t".to_string(),
            mood: "Chill".to_string(),
            last_message: "bye".to_string(),
            last_message_at: at,
        });
        assert_eq!(dto.timestamp, at.timestamp_millis());
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["lastMessage"], "bye");
    }
}
