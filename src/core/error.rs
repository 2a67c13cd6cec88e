//! Agent 错误类型
//!
//! 只有结构性失败（未知会话、路径逃逸、沙箱配置错误等）才是错误；
//! 工具执行失败 / 超时属于业务数据，记录在 ToolResult 中，不在此枚举出现。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的结构性错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 会话不存在（查找未命中，立即返回，不重试）
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 路径逃逸企图：参数解析后落在沙箱根目录之外（进程启动前即拒绝）
    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    /// 命令不在白名单内
    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    /// LLM 网关失败（含重试耗尽），保留底层原因供诊断
    #[error("LLM gateway error: {0}")]
    Llm(#[from] LlmError),

    /// 存储层失败（连接、编码等）
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 调用方取消（客户端断开等）
    #[error("Cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for AgentError {
    fn from(e: sqlx::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}
