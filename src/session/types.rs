//! 会话与消息模型
//!
//! Message 是按角色划分的和类型（sum type）：普通文本、助手的工具请求、工具结果。
//! 工具请求是显式的结构化变体，携带模型实际请求的调用列表，不用哨兵字符串标记。
//! arguments / result / metadata 对编排层不透明，持久化往返必须保持深度相等。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 模型发出的工具调用请求（瞬态，不直接落库；由 ToolRequestMessage 记录）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 不透明参数对象，原样传给沙箱与持久层
    pub arguments: Value,
}

/// 工具执行结局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::Timeout => "timeout",
        }
    }
}

/// 工具执行结果：失败与超时都是数据而非异常，模型在下一轮把它们当普通输出消费
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// 普通文本消息（system / user / assistant）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// 助手请求执行工具的记录：保留请求了哪些调用，供审计与结果关联
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolRequestMessage {
    pub id: String,
    pub calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// 单次工具调用的结果消息（role = tool）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub id: String,
    pub tool_name: String,
    /// 关联上一轮 ToolRequest 中对应调用的 id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// 可选的人读渲染
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// 会话日志中的一条消息；持久化边界对所有变体穷尽匹配
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Text(TextMessage),
    ToolRequest(ToolRequestMessage),
    Tool(ToolMessage),
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Message::Text(TextMessage {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata: None,
            created_at: Utc::now(),
        })
    }

    /// 助手的工具请求记录
    pub fn tool_request(calls: Vec<ToolCall>) -> Self {
        Message::ToolRequest(ToolRequestMessage {
            id: uuid::Uuid::new_v4().to_string(),
            calls,
            metadata: None,
            created_at: Utc::now(),
        })
    }

    /// 工具结果消息，与发起调用关联
    pub fn tool_result(call: &ToolCall, result: ToolResult) -> Self {
        Message::Tool(ToolMessage {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: call.name.clone(),
            tool_call_id: Some(call.id.clone()),
            arguments: Some(call.arguments.clone()),
            result: Some(result),
            content: None,
            metadata: None,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Message::Text(m) => &m.id,
            Message::ToolRequest(m) => &m.id,
            Message::Tool(m) => &m.id,
        }
    }

    /// 对外呈现的角色：工具请求属于 assistant 轮
    pub fn role(&self) -> Role {
        match self {
            Message::Text(m) => m.role,
            Message::ToolRequest(_) => Role::Assistant,
            Message::Tool(_) => Role::Tool,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Message::Text(m) => m.created_at,
            Message::ToolRequest(m) => m.created_at,
            Message::Tool(m) => m.created_at,
        }
    }
}

/// 会话：身份字段创建后不可变，messages 只增不改、不重排
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// 不透明的租户侧键值对
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traits: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}
