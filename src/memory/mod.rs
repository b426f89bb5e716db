//! 记忆层：对话消息模型与会话持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{Message, Role, ToolCall};
pub use persistence::{is_internal_session, SessionStore};
