use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChatStore, NewSession};
use crate::error::ComfyError;
use crate::models::{ChatSession, Message, Role, SessionSummary, User};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    sessions: HashMap<Uuid, ChatSession>,
    /// Insertion order doubles as creation order.
    messages: Vec<Message>,
}

/// Process-local store with the same semantics as the Postgres backend.
#[derive(Default)]
pub struct MemoryChatStore {
    tables: RwLock<Tables>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn find_user(&self, id: &str) -> Result<Option<User>, ComfyError> {
        Ok(self.tables.read().await.users.get(id).cloned())
    }

    async fn get_or_create_user(
        &self,
        id: &str,
        name: &str,
        email: &str,
    ) -> Result<User, ComfyError> {
        let mut tables = self.tables.write().await;
        let user = tables.users.entry(id.to_string()).or_insert_with(|| User {
            id: id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        });
        Ok(user.clone())
    }

    async fn find_session(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Option<ChatSession>, ComfyError> {
        Ok(self
            .tables
            .read()
            .await
            .sessions
            .get(&id)
            .filter(|s| s.user_id == user_id)
            .cloned())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>, ComfyError> {
        Ok(self.tables.read().await.sessions.get(&id).cloned())
    }

    async fn create_session(&self, new: NewSession) -> Result<ChatSession, ComfyError> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&new.user_id) {
            return Err(ComfyError::NotFound(format!("user {}", new.user_id)));
        }
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            title: new.title,
            mood: new.mood,
            created_at: now,
            last_message_at: now,
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), ComfyError> {
        let mut tables = self.tables.write().await;
        match tables.sessions.get_mut(&id) {
            Some(session) => {
                session.last_message_at = at;
                Ok(())
            }
            None => Err(ComfyError::NotFound(format!("session {}", id))),
        }
    }

    async fn delete_session(&self, id: Uuid) -> Result<bool, ComfyError> {
        let mut tables = self.tables.write().await;
        let existed = tables.sessions.remove(&id).is_some();
        if existed {
            tables.messages.retain(|m| m.session_id != id);
        }
        Ok(existed)
    }

    async fn create_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Message, ComfyError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session_id) {
            return Err(ComfyError::NotFound(format!("session {}", session_id)));
        }
        let message = Message {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, ComfyError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_session_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionSummary>, ComfyError> {
        let tables = self.tables.read().await;
        let mut summaries: Vec<SessionSummary> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| SessionSummary {
                id: s.id,
                title: s.title.clone(),
                mood: s.mood.clone(),
                last_message: tables
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.session_id == s.id)
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
                last_message_at: s.last_message_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(summaries)
    }

    async fn health(&self) -> Result<String, ComfyError> {
        let tables = self.tables.read().await;
        Ok(format!(
            "memory ({} users, {} sessions, {} messages)",
            tables.users.len(),
            tables.sessions.len(),
            tables.messages.len()
        ))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded() -> (MemoryChatStore, ChatSession) {
        let store = MemoryChatStore::new();
        store
            .get_or_create_user("u1", User::GUEST_NAME, &User::guest_email("u1"))
            .await
            .unwrap();
        let session = store
            .create_session(NewSession {
                user_id: "u1".to_string(),
                title: "first".to_string(),
                mood: "Chill".to_string(),
            })
            .await
            .unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn test_get_or_create_user_is_keyed_by_id() {
        let store = MemoryChatStore::new();
        let a = store.get_or_create_user("same", "A", "a@x").await.unwrap();
        let b = store.get_or_create_user("same", "B", "b@x").await.unwrap();
        assert_eq!(a.name, "A");
        assert_eq!(b.name, "A");
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_find_session_requires_owner() {
        let (store, session) = seeded().await;
        assert!(store.find_session(session.id, "u1").await.unwrap().is_some());
        assert!(store.find_session(session.id, "intruder").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_messages() {
        let (store, session) = seeded().await;
        store.create_message(session.id, Role::User, "hello").await.unwrap();
        assert!(store.delete_session(session.id).await.unwrap());
        assert!(store.list_messages(session.id).await.unwrap().is_empty());
        assert!(!store.delete_session(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_summaries_most_recent_first_with_preview() {
        let (store, older) = seeded().await;
        let newer = store
            .create_session(NewSession {
                user_id: "u1".to_string(),
                title: "second".to_string(),
                mood: "Tired".to_string(),
            })
            .await
            .unwrap();
        store.create_message(older.id, Role::User, "q").await.unwrap();
        store.create_message(older.id, Role::Assistant, "a").await.unwrap();
        store
            .touch_session(newer.id, Utc::now() + Duration::seconds(5))
            .await
            .unwrap();

        let summaries = store.list_session_summaries("u1").await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, newer.id);
        assert_eq!(summaries[0].last_message, "");
        assert_eq!(summaries[1].last_message, "a");
    }

    #[tokio::test]
    async fn test_message_for_missing_session_is_rejected() {
        let store = MemoryChatStore::new();
        let err = store
            .create_message(Uuid::new_v4(), Role::User, "orphan")
            .await
            .unwrap_err();
        assert!(matches!(err, ComfyError::NotFound(_)));
    }
}
