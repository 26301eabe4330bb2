pub mod api;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sse;
pub mod store;

pub use completion::{
    create_backend, CompletionBackend, CompletionConfig, CompletionError, CompletionRequest,
    FragmentStream, GroqCompletionClient, PromptMessage,
};
pub use config::ComfyConfig;
pub use error::ComfyError;
pub use models::{ChatSession, Message, Role, SessionSummary, User};
pub use sse::UpstreamEvent;
pub use store::{create_store, ChatStore, MemoryChatStore, NewSession, PgChatStore};
