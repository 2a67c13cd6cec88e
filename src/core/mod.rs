//! 核心层：错误分类与通用重试策略

pub mod error;
pub mod retry;

pub use error::AgentError;
pub use retry::{backoff_delay, retry, RetryConfig, RetryError, Retryable};
