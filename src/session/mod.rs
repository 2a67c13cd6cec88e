//! 会话层：消息模型与仅追加的存储（内存 / SQLite）

pub mod sqlite;
pub mod store;
pub mod types;

pub use sqlite::SqliteSessionStore;
pub use store::{InMemorySessionStore, NewSession, SessionStore};
pub use types::{
    Message, Role, Session, TextMessage, ToolCall, ToolMessage, ToolRequestMessage, ToolResult,
    ToolStatus,
};
