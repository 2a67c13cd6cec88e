//! LLM 网关层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{
    FinishReason, GenerateOptions, HealthStatus, LlmClient, LlmError, LlmResponse, TokenStream,
    ToolSpec,
};
