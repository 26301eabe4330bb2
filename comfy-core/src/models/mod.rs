mod message;
mod session;
mod user;

pub use message::{Message, Role};
pub use session::{derive_title, ChatSession, SessionSummary, DEFAULT_MOOD, TITLE_MAX_CHARS};
pub use user::User;
