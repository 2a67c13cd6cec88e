//! 编排层：有界对话循环与流式事件

pub mod events;
pub mod orchestrator;

pub use events::ChatEvent;
pub use orchestrator::Orchestrator;
