//! 会话存储契约与内存实现
//!
//! SessionStore 是仅追加的消息日志：create / get / append / delete。
//! append 在存储内部串行化（写锁或事务），并发轮次不会交错破坏日志顺序；
//! 同一会话上并发用户轮次的排队由传输层负责。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::session::{Message, Session};

/// 创建会话的输入；id 与 created_at 由存储生成
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub traits: Option<Value>,
}

/// 仅追加的会话存储；内存与 SQLite 两种实现外部行为一致
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, input: NewSession) -> Result<Session, AgentError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, AgentError>;

    /// 追加一条消息并返回追加后的会话快照；会话不存在时返回 SessionNotFound
    async fn append_message(&self, id: &str, message: Message) -> Result<Session, AgentError>;

    /// 删除会话及其全部消息
    async fn delete_session(&self, id: &str) -> Result<(), AgentError>;
}

/// 易失性内存实现：进程内 HashMap，重启即丢
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, input: NewSession) -> Result<Session, AgentError> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: input.tenant_id,
            user_id: input.user_id,
            traits: input.traits,
            created_at: Utc::now(),
            messages: Vec::new(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, AgentError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<Session, AgentError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;
        session.messages.push(message);
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &str) -> Result<(), AgentError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ToolCall, ToolResult, ToolStatus};
    use serde_json::json;

    fn store() -> InMemorySessionStore {
        InMemorySessionStore::new()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let created = store
            .create_session(NewSession {
                tenant_id: "t1".to_string(),
                user_id: Some("u1".to_string()),
                traits: Some(json!({"plan": "pro"})),
            })
            .await
            .unwrap();

        let loaded = store.get_session(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_prior_messages() {
        let store = store();
        let session = store
            .create_session(NewSession {
                tenant_id: "t1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .append_message(&session.id, Message::user("hello"))
            .await
            .unwrap();
        let before = store.get_session(&session.id).await.unwrap().unwrap();

        let after = store
            .append_message(&session.id, Message::assistant("hi"))
            .await
            .unwrap();

        // 已有消息原样保留、顺序不变
        assert_eq!(after.messages[0], before.messages[0]);
        assert_eq!(after.messages.len(), 2);
        assert_eq!(after.messages[1].role(), crate::session::Role::Assistant);
    }

    #[tokio::test]
    async fn test_append_unknown_session() {
        let store = store();
        let err = store
            .append_message("nope", Message::user("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_opaque_fields_roundtrip() {
        let store = store();
        let session = store
            .create_session(NewSession {
                tenant_id: "t1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let call = ToolCall {
            id: "call_1".to_string(),
            name: "cat".to_string(),
            arguments: json!({"a": 1}),
        };
        let result = ToolResult {
            status: ToolStatus::Success,
            stdout: Some("x".to_string()),
            stderr: None,
            exit_code: Some(0),
            duration_ms: Some(3),
            truncated: false,
            error_message: None,
            metadata: None,
        };
        store
            .append_message(&session.id, Message::tool_result(&call, result.clone()))
            .await
            .unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        match &loaded.messages[0] {
            Message::Tool(m) => {
                assert_eq!(m.arguments, Some(json!({"a": 1})));
                assert_eq!(m.result, Some(result));
            }
            other => panic!("expected tool message, got {:?}", other),
        }
    }
}
