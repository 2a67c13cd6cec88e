//! 对话过程事件：供流式前端消费
//!
//! 传输层把事件序列装进自己的推送帧（每事件一帧，终端帧为 completed 或错误）。

use serde::Serialize;

use crate::session::TextMessage;

/// 流式回答事件：若干 Delta 之后以 Completed 收尾
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// 最终回复的一小段增量
    Delta { text: String },
    /// 回答完成；message 即落库的最终助手消息
    Completed { message: TextMessage },
}
