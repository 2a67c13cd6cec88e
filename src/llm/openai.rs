//! OpenAI 兼容 API 网关
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）。直接持有 HTTP 层
//! 是为了失败分类：429 连同 retry-after 头、5xx/网络瞬态、其余 4xx 致命。
//! 每次调用都经过 core::retry 包装；流式走 SSE（data: 行，[DONE] 结束）。

use std::time::{Duration, Instant};

use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use async_trait::async_trait;

use crate::core::{retry, RetryConfig, RetryError};
use crate::llm::{
    FinishReason, GenerateOptions, HealthStatus, LlmClient, LlmError, LlmResponse, TokenStream,
};
use crate::session::{Message, ToolCall, ToolResult};

/// OpenAI 兼容客户端：持有 HTTP 客户端、端点与重试参数
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetryConfig,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.request_timeout = request;
        self.stream_timeout = stream;
        self
    }

    fn request_body(&self, history: &[Message], options: &GenerateOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": to_wire_messages(history),
            "stream": stream,
        });
        if let Some(max) = options.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(tools) = &options.tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(
                    tools
                        .iter()
                        .map(|t| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.input_schema,
                                },
                            })
                        })
                        .collect(),
                );
            }
        }
        body
    }

    /// 单次非流式调用（重试包装前的裸调用）
    async fn generate_once(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&self.request_body(history, options, false))
            .send()
            .await
            .map_err(classify_network)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_completion(completion)
    }

    /// 建立流式连接并校验状态码（重试只覆盖连接建立，不覆盖流中断）
    async fn begin_stream(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.stream_timeout)
            .json(&self.request_body(history, options, true))
            .send()
            .await
            .map_err(classify_network)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<LlmResponse, LlmError> {
        retry(&self.retry, || self.generate_once(history, options))
            .await
            .map_err(flatten_retry)
    }

    async fn generate_stream(
        &self,
        history: &[Message],
        options: &GenerateOptions,
    ) -> Result<TokenStream, LlmError> {
        let response = retry(&self.retry, || self.begin_stream(history, options))
            .await
            .map_err(flatten_retry)?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<String, LlmError>>();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Transient {
                            status: None,
                            message: format!("stream interrupted: {e}"),
                        }));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Some(delta) = parse_stream_delta(payload) {
                        if !delta.is_empty() && tx.send(Ok(delta)).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn health_check(&self) -> HealthStatus {
        let url = format!("{}/models", self.base_url);
        let start = Instant::now();
        let result = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(r) if r.status().is_success() => HealthStatus {
                healthy: true,
                latency_ms,
                error: None,
            },
            Ok(r) => HealthStatus {
                healthy: false,
                latency_ms,
                error: Some(format!("provider returned {}", r.status())),
            },
            Err(e) => HealthStatus {
                healthy: false,
                latency_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

/// 将消息历史渲染为 chat/completions 的 turn 数组
fn to_wire_messages(history: &[Message]) -> Vec<Value> {
    history
        .iter()
        .map(|m| match m {
            Message::Text(t) => json!({
                "role": t.role.as_str(),
                "content": t.content,
            }),
            Message::ToolRequest(r) => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": r.calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.name,
                        "arguments": c.arguments.to_string(),
                    },
                })).collect::<Vec<_>>(),
            }),
            Message::Tool(t) => {
                let content = t
                    .content
                    .clone()
                    .unwrap_or_else(|| render_tool_result(t.result.as_ref()));
                match &t.tool_call_id {
                    Some(call_id) => json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": content,
                    }),
                    None => json!({ "role": "tool", "content": content }),
                }
            }
        })
        .collect()
}

/// 工具结果的结构化文本块：状态、输出、退出码、截断标记、耗时、元数据
fn render_tool_result(result: Option<&ToolResult>) -> String {
    let Some(r) = result else {
        return "(no result)".to_string();
    };
    let mut block = format!("status: {}\n", r.status.as_str());
    if let Some(code) = r.exit_code {
        block.push_str(&format!("exit_code: {code}\n"));
    }
    if let Some(ms) = r.duration_ms {
        block.push_str(&format!("duration_ms: {ms}\n"));
    }
    if r.truncated {
        block.push_str("truncated: true\n");
    }
    if let Some(err) = &r.error_message {
        block.push_str(&format!("error: {err}\n"));
    }
    if let Some(stdout) = &r.stdout {
        if !stdout.is_empty() {
            block.push_str(&format!("stdout:\n{stdout}\n"));
        }
    }
    if let Some(stderr) = &r.stderr {
        if !stderr.is_empty() {
            block.push_str(&format!("stderr:\n{stderr}\n"));
        }
    }
    if let Some(meta) = &r.metadata {
        block.push_str(&format!("metadata: {meta}\n"));
    }
    block
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

fn parse_completion(completion: ChatCompletion) -> Result<LlmResponse, LlmError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            name: c.function.name,
            // 参数是 JSON 字符串；解析失败时保留原文，交由下游报错
            arguments: serde_json::from_str(&c.function.arguments)
                .unwrap_or(Value::String(c.function.arguments)),
        })
        .collect();

    let finish_reason = match choice.finish_reason.as_deref() {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("stop") | None => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some(_) => FinishReason::Error,
    };

    Ok(LlmResponse {
        content: choice.message.content,
        tool_calls,
        finish_reason,
    })
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

fn parse_stream_delta(payload: &str) -> Option<String> {
    let chunk: StreamChunk = serde_json::from_str(payload).ok()?;
    chunk.choices.into_iter().next()?.delta.content
}

/// HTTP 状态分类：429 限流（带 retry-after 提示）、5xx/408 瞬态、其余 4xx 致命
fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> LlmError {
    let message = truncate_body(body);
    match status {
        429 => LlmError::RateLimited {
            retry_after,
            message,
        },
        408 => LlmError::Transient {
            status: Some(status),
            message,
        },
        s if s >= 500 => LlmError::Transient {
            status: Some(status),
            message,
        },
        s if s >= 400 => LlmError::Fatal { status: s, message },
        s => LlmError::InvalidResponse(format!("unexpected status {s}: {message}")),
    }
}

fn classify_network(err: reqwest::Error) -> LlmError {
    LlmError::Transient {
        status: None,
        message: err.to_string(),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn flatten_retry(err: RetryError<LlmError>) -> LlmError {
    match err {
        RetryError::Aborted(e) => e,
        RetryError::Exhausted { attempts, last } => LlmError::RetryExhausted {
            attempts,
            last: Box::new(last),
        },
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        format!("{}...", body.chars().take(300).collect::<String>())
    } else {
        body.to_string()
    }
}
