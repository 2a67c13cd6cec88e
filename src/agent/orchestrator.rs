//! 对话编排器：有界多回合智能体循环
//!
//! 追加用户消息后循环：调用模型（带固定工具清单）；模型要求工具时记录
//! 工具请求、并发执行全部调用并按请求顺序写回结果；模型给出最终文本时
//! 落库返回。回合数达到上限时合成一条说明性助手消息（软降级，不抛错）。
//! 同一会话上并发用户轮次的串行化由传输层负责；存储层保证单条追加的原子性。

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::ChatEvent;
use crate::core::AgentError;
use crate::llm::{GenerateOptions, LlmClient};
use crate::session::{Message, SessionStore, TextMessage, ToolCall, ToolResult};
use crate::tools::{tool_manifest, ToolSandbox};

/// 单轮对话默认最大回合数，防止模型无限请求工具
const DEFAULT_MAX_ROUNDS: usize = 10;
/// 流式回复时每段字符数（模拟打字效果）
const CHUNK_CHARS: usize = 6;

/// 编排器：组合模型网关、沙箱与会话存储
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    llm: Arc<dyn LlmClient>,
    sandbox: Arc<ToolSandbox>,
    max_rounds: usize,
    max_output_tokens: Option<u32>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        llm: Arc<dyn LlmClient>,
        sandbox: Arc<ToolSandbox>,
    ) -> Self {
        Self {
            store,
            llm,
            sandbox,
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_output_tokens: None,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// 每次模型调用的输出 token 上限
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    /// 处理单条用户消息，返回最终助手消息；会话不存在时返回 SessionNotFound
    pub async fn handle_user_message(
        &self,
        session_id: &str,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<TextMessage, AgentError> {
        self.run_turn(session_id, text, None, &cancel).await
    }

    /// 流式变体：经 event_tx 推送 Delta 序列，以 Completed 收尾。
    /// 工具回合原子执行、不产生增量；只有终端的非工具回合以增量形式输出。
    pub async fn handle_user_message_streaming(
        &self,
        session_id: &str,
        text: &str,
        event_tx: mpsc::UnboundedSender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<TextMessage, AgentError> {
        self.run_turn(session_id, text, Some(&event_tx), &cancel).await
    }

    async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        event_tx: Option<&mpsc::UnboundedSender<ChatEvent>>,
        cancel: &CancellationToken,
    ) -> Result<TextMessage, AgentError> {
        // 先确认会话存在：未知会话在任何事件发出之前失败
        if self.store.get_session(session_id).await?.is_none() {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }

        let mut session = self
            .store
            .append_message(session_id, Message::user(text))
            .await?;

        let options = GenerateOptions {
            tools: Some(tool_manifest()),
            max_output_tokens: self.max_output_tokens,
        };

        for round in 0..self.max_rounds {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let response = self.llm.generate(&session.messages, &options).await?;

            if !response.tool_calls.is_empty() {
                let calls = response.tool_calls;
                tracing::info!(
                    round,
                    calls = calls.len(),
                    "model requested tool execution"
                );
                session = self
                    .store
                    .append_message(session_id, Message::tool_request(calls.clone()))
                    .await?;

                // 同一回合内的调用并发执行；join_all 保持请求顺序，
                // 结果消息按请求顺序而非完成顺序追加
                let results =
                    join_all(calls.iter().map(|c| self.dispatch_call(c, cancel))).await;
                for (call, result) in calls.iter().zip(results) {
                    let result = result?;
                    session = self
                        .store
                        .append_message(session_id, Message::tool_result(call, result))
                        .await?;
                }
                continue;
            }

            let content = response.content.unwrap_or_default();
            return self.finish(session_id, content, event_tx).await;
        }

        // 回合上限：软降级为一条说明性回复，不让日志无界增长
        tracing::warn!(max_rounds = self.max_rounds, "round limit exceeded");
        let notice = format!(
            "已达到单轮对话的最大回合数限制 ({})，无法在限制内完成回答。",
            self.max_rounds
        );
        self.finish(session_id, notice, event_tx).await
    }

    async fn dispatch_call(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let args = parse_args(&call.arguments);
        self.sandbox.execute(&call.name, &args, cancel).await
    }

    /// 落库最终助手消息；流式时先按固定段长推送增量，再推送 Completed
    async fn finish(
        &self,
        session_id: &str,
        content: String,
        event_tx: Option<&mpsc::UnboundedSender<ChatEvent>>,
    ) -> Result<TextMessage, AgentError> {
        let message = Message::assistant(content);
        self.store.append_message(session_id, message.clone()).await?;

        let Message::Text(text_message) = message else {
            // assistant 构造器只产生文本变体
            return Err(AgentError::Storage("assistant message was not text".into()));
        };

        if let Some(tx) = event_tx {
            let chars: Vec<char> = text_message.content.chars().collect();
            for chunk in chars.chunks(CHUNK_CHARS) {
                let _ = tx.send(ChatEvent::Delta {
                    text: chunk.iter().collect(),
                });
            }
            let _ = tx.send(ChatEvent::Completed {
                message: text_message.clone(),
            });
        }

        Ok(text_message)
    }
}

/// 工具参数形态为 {"args": ["...", ...]}；非字符串元素按 JSON 文本传入
fn parse_args(arguments: &Value) -> Vec<String> {
    arguments
        .get("args")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_args_strings_and_numbers() {
        assert_eq!(
            parse_args(&json!({"args": ["-n", "3", "a.txt"]})),
            vec!["-n", "3", "a.txt"]
        );
        assert_eq!(parse_args(&json!({"args": [5]})), vec!["5"]);
        assert_eq!(parse_args(&json!({})), Vec::<String>::new());
        assert_eq!(parse_args(&json!({"args": "oops"})), Vec::<String>::new());
    }
}
