//! LLM 网关抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：generate（非流式）、
//! generate_stream（流式增量文本）、health_check（存活探测，永不抛错）。
//! LlmError 按可恢复性分类：429 限流 / 5xx 与网络瞬态 / 其余 4xx 致命。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::Retryable;
use crate::session::{Message, ToolCall};

/// 流式增量文本
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 暴露给模型的工具定义（供应商中立形态）
#[derive(Clone, Debug, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema 形态的参数描述
    pub input_schema: Value,
}

/// 单次调用选项
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub tools: Option<Vec<ToolSpec>>,
    /// 每次调用的输出 token 上限
    pub max_output_tokens: Option<u32>,
}

/// 模型结束原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

/// 一次模型调用的结果：最终文本或一组工具调用
#[derive(Clone, Debug)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

impl LlmResponse {
    /// 纯文本回复
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }

    /// 工具调用回复
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
            finish_reason: FinishReason::ToolCalls,
        }
    }
}

/// 存活探测结果；探测失败记录在 error 字段而非抛出
#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 网关失败分类
#[derive(Error, Debug)]
pub enum LlmError {
    /// 上游限流（HTTP 429）；retry_after 取自响应头（秒）
    #[error("Rate limited by provider (retry after {retry_after:?}s): {message}")]
    RateLimited {
        retry_after: Option<u64>,
        message: String,
    },

    /// 瞬态失败：5xx、网络错误、请求超时
    #[error("Transient provider failure ({status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// 致命失败：其余 4xx（鉴权、参数错误等），不重试
    #[error("Provider rejected request ({status}): {message}")]
    Fatal { status: u16, message: String },

    /// 响应体不符合预期格式
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// 内部重试耗尽；携带尝试次数与最后一次底层错误
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<LlmError> },
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Transient { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } => retry_after.map(Duration::from_secs),
            _ => None,
        }
    }
}

/// LLM 网关 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式调用：带工具清单的一轮补全
    async fn generate(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError>;

    /// 流式调用：返回增量文本流，拼接后即完整回复
    async fn generate_stream(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<TokenStream, LlmError>;

    /// 存活探测；实现不得抛错
    async fn health_check(&self) -> HealthStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_retryable_with_hint() {
        let err = LlmError::RateLimited {
            retry_after: Some(60),
            message: "too many requests".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_fatal_is_not_retryable() {
        let err = LlmError::Fatal {
            status: 401,
            message: "bad key".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_transient_is_retryable_without_hint() {
        let err = LlmError::Transient {
            status: Some(503),
            message: "overloaded".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }
}
