//! Mole - Rust 沙箱问答智能体
//!
//! 模块划分：
//! - **agent**: 对话编排器（有界多回合循环、流式事件）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与通用重试策略
//! - **llm**: LLM 网关抽象与实现（OpenAI 兼容 / Mock）
//! - **session**: 消息模型与仅追加的会话存储（内存 / SQLite）
//! - **tools**: 固定工具清单与沙箱命令执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod session;
pub mod tools;
