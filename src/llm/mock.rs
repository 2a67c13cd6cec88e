//! Mock LLM 客户端（离线模式与测试用，无需 API）
//!
//! 按脚本顺序回放预设响应；脚本耗尽后回退为回显最后一条用户消息，
//! 便于在没有 API Key 的环境跑通整个对话循环。

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::Mutex;

use crate::llm::{
    GenerateOptions, HealthStatus, LlmClient, LlmError, LlmResponse, TokenStream,
};
use crate::session::{Message, Role};

/// 流式回放时每段字符数（模拟打字效果）
const CHUNK_CHARS: usize = 6;

/// Mock 客户端：回放脚本，或固定响应，或回显
pub struct MockLlmClient {
    script: Mutex<VecDeque<LlmResponse>>,
    /// 脚本耗尽后的固定响应；None 时回显最后一条用户消息
    fallback: Option<LlmResponse>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// 纯回显模式
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
        }
    }

    /// 按脚本顺序回放；耗尽后回显
    pub fn with_script(responses: Vec<LlmResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            fallback: None,
        }
    }

    /// 每次调用都返回同一响应（如恒定工具调用，用于回合上限测试）
    pub fn always(response: LlmResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
        }
    }

    async fn next_response(&self, history: &[Message]) -> LlmResponse {
        if let Some(scripted) = self.script.lock().await.pop_front() {
            return scripted;
        }
        if let Some(fixed) = &self.fallback {
            return fixed.clone();
        }
        let last_user = history
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::Text(t) if t.role == Role::User => Some(t.content.as_str()),
                _ => None,
            })
            .unwrap_or("(no input)");
        LlmResponse::text(format!("Echo from Mock: {last_user}"))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(
        &self,
        history: &[Message],
        _options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError> {
        Ok(self.next_response(history).await)
    }

    async fn generate_stream(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<TokenStream, LlmError> {
        let response = self.generate(history, options).await?;
        let content = response.content.unwrap_or_default();
        let chunks: Vec<Result<String, LlmError>> = content
            .chars()
            .collect::<Vec<_>>()
            .chunks(CHUNK_CHARS)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            latency_ms: 0,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_script_plays_in_order_then_echoes() {
        let mock = MockLlmClient::with_script(vec![LlmResponse::text("first")]);
        let history = vec![Message::user("hello")];
        let options = GenerateOptions::default();

        let r1 = mock.generate(&history, &options).await.unwrap();
        assert_eq!(r1.content.as_deref(), Some("first"));

        // 脚本耗尽后回显最后一条用户消息
        let r2 = mock.generate(&history, &options).await.unwrap();
        assert!(r2.content.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_stream_chunks_concatenate_to_full_reply() {
        let mock = MockLlmClient::with_script(vec![LlmResponse::text("streamed mock reply")]);
        let mut stream = mock
            .generate_stream(&[], &GenerateOptions::default())
            .await
            .unwrap();

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "streamed mock reply");
    }

    #[tokio::test]
    async fn test_health_check_never_fails() {
        let status = MockLlmClient::new().health_check().await;
        assert!(status.healthy);
        assert!(status.error.is_none());
    }
}
