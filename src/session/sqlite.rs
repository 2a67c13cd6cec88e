//! 异步 SQLite 会话存储
//!
//! 使用 sqlx 提供完全异步的数据库操作。连接池是显式持有、注入式的资源，
//! 由调用方构建并传入，没有模块级单例。消息以关系行存储：
//! 不透明的 traits / arguments / result / metadata 序列化为 JSON 文本列，
//! 读回时反序列化，保证与写入值深度相等。

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::session::store::{NewSession, SessionStore};
use crate::session::{Message, Role, Session, TextMessage, ToolMessage, ToolRequestMessage};

/// SQLite 会话存储：sessions 与 messages 两张表，messages 级联删除
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// 打开（或创建）数据库文件并建表；外键约束在连接层开启
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 进程内内存库（测试用）；单连接，连接断开即丢弃
    pub async fn in_memory() -> Result<Self, AgentError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AgentError::Storage(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 从已有连接池创建（池由调用方负责生命周期）
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, AgentError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), AgentError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT,
                traits TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT,
                tool_name TEXT,
                tool_call_id TEXT,
                arguments TEXT,
                result TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        // rowid 反映插入顺序，即追加顺序
        let rows = sqlx::query(
            "SELECT id, role, content, tool_name, tool_call_id, arguments, result, metadata, created_at
             FROM messages WHERE session_id = ? ORDER BY rowid ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_message).collect()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, input: NewSession) -> Result<Session, AgentError> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: input.tenant_id,
            user_id: input.user_id,
            traits: input.traits,
            created_at: Utc::now(),
            messages: Vec::new(),
        };

        let traits_json = encode_json(&session.traits)?;
        sqlx::query(
            "INSERT INTO sessions (id, tenant_id, user_id, traits, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.tenant_id)
        .bind(&session.user_id)
        .bind(traits_json)
        .bind(session.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, AgentError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, user_id, traits, created_at FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let traits: Option<String> = row.get("traits");
        let created_at: String = row.get("created_at");
        let messages = self.load_messages(id).await?;

        Ok(Some(Session {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            user_id: row.get("user_id"),
            traits: decode_json(traits)?,
            created_at: parse_timestamp(&created_at)?,
            messages,
        }))
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<Session, AgentError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AgentError::SessionNotFound(id.to_string()));
        }

        let row = encode_message(&message)?;
        sqlx::query(
            "INSERT INTO messages
                (id, session_id, role, content, tool_name, tool_call_id, arguments, result, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id())
        .bind(id)
        .bind(row.role)
        .bind(row.content)
        .bind(row.tool_name)
        .bind(row.tool_call_id)
        .bind(row.arguments)
        .bind(row.result)
        .bind(row.metadata)
        .bind(message.created_at().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_session(id)
            .await?
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    async fn delete_session(&self, id: &str) -> Result<(), AgentError> {
        // 级联删除由外键约束负责
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// messages 表的一行（编码侧）
struct MessageRow {
    role: &'static str,
    content: Option<String>,
    tool_name: Option<String>,
    tool_call_id: Option<String>,
    arguments: Option<String>,
    result: Option<String>,
    metadata: Option<String>,
}

/// 穷尽匹配所有消息变体编码为行；新增变体时此处编译期报错而非静默丢字段
fn encode_message(message: &Message) -> Result<MessageRow, AgentError> {
    Ok(match message {
        Message::Text(m) => MessageRow {
            role: m.role.as_str(),
            content: Some(m.content.clone()),
            tool_name: None,
            tool_call_id: None,
            arguments: None,
            result: None,
            metadata: encode_json(&m.metadata)?,
        },
        Message::ToolRequest(m) => MessageRow {
            role: Role::Assistant.as_str(),
            content: None,
            tool_name: None,
            tool_call_id: None,
            // 请求的调用列表整体存入 arguments 列
            arguments: Some(to_json_text(&m.calls)?),
            result: None,
            metadata: encode_json(&m.metadata)?,
        },
        Message::Tool(m) => MessageRow {
            role: Role::Tool.as_str(),
            content: m.content.clone(),
            tool_name: Some(m.tool_name.clone()),
            tool_call_id: m.tool_call_id.clone(),
            arguments: encode_json(&m.arguments)?,
            result: m.result.as_ref().map(to_json_text).transpose()?,
            metadata: encode_json(&m.metadata)?,
        },
    })
}

fn decode_message(row: sqlx::sqlite::SqliteRow) -> Result<Message, AgentError> {
    let id: String = row.get("id");
    let role: String = row.get("role");
    let content: Option<String> = row.get("content");
    let tool_name: Option<String> = row.get("tool_name");
    let tool_call_id: Option<String> = row.get("tool_call_id");
    let arguments: Option<String> = row.get("arguments");
    let result: Option<String> = row.get("result");
    let metadata: Option<String> = row.get("metadata");
    let created_at = parse_timestamp(&row.get::<String, _>("created_at"))?;

    let message = match role.as_str() {
        "tool" => Message::Tool(ToolMessage {
            id,
            tool_name: tool_name.unwrap_or_default(),
            tool_call_id,
            arguments: decode_json(arguments)?,
            result: result
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| AgentError::Storage(format!("bad tool result: {e}")))?,
            content,
            metadata: decode_json(metadata)?,
            created_at,
        }),
        // assistant 行没有 content 而有 arguments，即工具请求记录
        "assistant" if content.is_none() && arguments.is_some() => {
            let calls = serde_json::from_str(arguments.as_deref().unwrap_or("[]"))
                .map_err(|e| AgentError::Storage(format!("bad tool calls: {e}")))?;
            Message::ToolRequest(ToolRequestMessage {
                id,
                calls,
                metadata: decode_json(metadata)?,
                created_at,
            })
        }
        other => Message::Text(TextMessage {
            id,
            role: match other {
                "system" => Role::System,
                "assistant" => Role::Assistant,
                _ => Role::User,
            },
            content: content.unwrap_or_default(),
            metadata: decode_json(metadata)?,
            created_at,
        }),
    };
    Ok(message)
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, AgentError> {
    serde_json::to_string(value).map_err(|e| AgentError::Storage(e.to_string()))
}

fn encode_json(value: &Option<Value>) -> Result<Option<String>, AgentError> {
    value.as_ref().map(to_json_text).transpose()
}

fn decode_json(text: Option<String>) -> Result<Option<Value>, AgentError> {
    text.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| AgentError::Storage(format!("bad json column: {e}")))
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, AgentError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AgentError::Storage(format!("bad timestamp {text}: {e}")))
}
