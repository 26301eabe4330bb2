//! Session resolution: turn a (user id, optional session id) pair from the
//! client into stored user and session rows, creating whichever is missing.

use comfy_core::models::{derive_title, DEFAULT_MOOD};
use comfy_core::{ChatSession, ChatStore, ComfyError, NewSession, User};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub user: User,
    pub session: ChatSession,
    pub created_user: bool,
    pub created_session: bool,
}

/// Resolve or create the user and session for one chat request.
///
/// A session id that is malformed, unknown, or owned by another user is
/// treated as absent and a fresh session is created. At most one user insert
/// and one session insert happen per call; store errors are returned as-is.
pub async fn resolve_session(
    store: &dyn ChatStore,
    user_id: &str,
    session_id: Option<&str>,
    title_seed: Option<&str>,
    mood: Option<&str>,
) -> Result<ResolvedSession, ComfyError> {
    let (user, created_user) = match store.find_user(user_id).await? {
        Some(user) => (user, false),
        None => {
            let user = store
                .get_or_create_user(user_id, User::GUEST_NAME, &User::guest_email(user_id))
                .await?;
            tracing::info!(user_id = %user.id, "Created guest user");
            (user, true)
        }
    };

    let existing = match session_id.filter(|s| !s.is_empty()) {
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) => store.find_session(id, &user.id).await?,
            Err(_) => {
                tracing::debug!(session_id = %raw, "Ignoring malformed session id");
                None
            }
        },
        None => None,
    };

    if let Some(session) = existing {
        return Ok(ResolvedSession {
            user,
            session,
            created_user,
            created_session: false,
        });
    }

    let mood = mood
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_MOOD)
        .to_string();
    let session = store
        .create_session(NewSession {
            user_id: user.id.clone(),
            title: derive_title(title_seed),
            mood,
        })
        .await?;
    tracing::info!(
        user_id = %user.id,
        session_id = %session.id,
        title = %session.title,
        "Created chat session"
    );

    Ok(ResolvedSession {
        user,
        session,
        created_user,
        created_session: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use comfy_core::MemoryChatStore;

    #[tokio::test]
    async fn test_unknown_user_gets_guest_profile_and_session() {
        let store = MemoryChatStore::new();
        let resolved = resolve_session(&store, "user_new", None, Some("Hello there"), None)
            .await
            .unwrap();

        assert!(resolved.created_user);
        assert!(resolved.created_session);
        assert_eq!(resolved.user.name, "Guest User");
        assert_eq!(resolved.user.email, "user_new@comfy.app");
        assert_eq!(resolved.session.title, "Hello there");
        assert_eq!(resolved.session.mood, "neutral");
    }

    #[tokio::test]
    async fn test_existing_session_is_reused() {
        let store = MemoryChatStore::new();
        let first = resolve_session(&store, "u1", None, Some("first"), Some("Chill"))
            .await
            .unwrap();
        let id = first.session.id.to_string();

        let second = resolve_session(&store, "u1", Some(&id), Some("second"), Some("Tired"))
            .await
            .unwrap();

        assert!(!second.created_user);
        assert!(!second.created_session);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.mood, "Chill");
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_foreign_session_is_not_reused() {
        let store = MemoryChatStore::new();
        let owner = resolve_session(&store, "owner", None, Some("mine"), None)
            .await
            .unwrap();
        let foreign_id = owner.session.id.to_string();

        let intruder = resolve_session(&store, "intruder", Some(&foreign_id), Some("hi"), None)
            .await
            .unwrap();

        assert!(intruder.created_session);
        assert_ne!(intruder.session.id, owner.session.id);
        assert_eq!(intruder.session.user_id, "intruder");
        assert_eq!(store.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_or_missing_session_id_creates_new() {
        let store = MemoryChatStore::new();
        let a = resolve_session(&store, "u", Some("not-a-uuid"), Some("a"), None)
            .await
            .unwrap();
        let b = resolve_session(&store, "u", Some(&Uuid::new_v4().to_string()), Some("b"), None)
            .await
            .unwrap();
        assert!(a.created_session && b.created_session);
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_title_placeholders() {
        let store = MemoryChatStore::new();
        let blank = resolve_session(&store, "u", None, Some("   "), Some(""))
            .await
            .unwrap();
        let empty = resolve_session(&store, "u", None, None, None).await.unwrap();
        assert_eq!(blank.session.title, "Untitled Chat");
        assert_eq!(blank.session.mood, "neutral");
        assert_eq!(empty.session.title, "New Chat");
    }
}
