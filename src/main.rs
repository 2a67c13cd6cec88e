//! Mole - Rust 沙箱问答智能体
//!
//! 入口：初始化日志、加载配置、校验沙箱、组装编排器，并运行 stdin 对话循环。
//! HTTP 传输层不在本仓库内；这里提供最小的本地会话入口。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mole::agent::Orchestrator;
use mole::config::load_config;
use mole::llm::{LlmClient, MockLlmClient, OpenAiClient};
use mole::session::{InMemorySessionStore, NewSession, SessionStore, SqliteSessionStore};
use mole::tools::ToolSandbox;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).context("Failed to load config")?;

    // 沙箱根目录：缺省 ./workspace；启动前校验绝对且存在
    let root = match &cfg.tools.sandbox_root {
        Some(p) => p.clone(),
        None => std::env::current_dir()?.join("workspace"),
    };
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create sandbox root {}", root.display()))?;
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize {}", root.display()))?;
    let sandbox = ToolSandbox::new(
        &root,
        Duration::from_secs(cfg.tools.tool_timeout_secs),
        cfg.tools.max_output_bytes,
    );
    sandbox
        .validate_working_directory()
        .context("Sandbox root validation failed")?;

    // 无 API Key 时回退 Mock，保证离线可跑
    let llm: Arc<dyn LlmClient> = if cfg.llm.provider == "mock"
        || std::env::var("OPENAI_API_KEY").unwrap_or_default().is_empty()
    {
        tracing::info!("no OPENAI_API_KEY, using mock LLM client");
        Arc::new(MockLlmClient::new())
    } else {
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, None)
                .with_retry(cfg.retry.to_retry_config())
                .with_timeouts(
                    Duration::from_secs(cfg.llm.timeouts.request),
                    Duration::from_secs(cfg.llm.timeouts.stream),
                ),
        )
    };

    // 启动时探测一次模型存活；失败只告警，不阻止启动
    let health = llm.health_check().await;
    if health.healthy {
        tracing::info!(latency_ms = health.latency_ms, "llm health probe ok");
    } else {
        tracing::warn!(error = ?health.error, "llm health probe failed, continuing");
    }

    let store: Arc<dyn SessionStore> = match cfg.storage.backend.as_str() {
        "sqlite" => {
            if let Some(parent) = cfg.storage.db_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create db directory {}", parent.display())
                })?;
            }
            Arc::new(
                SqliteSessionStore::new(&cfg.storage.db_path)
                    .await
                    .context("Failed to open sqlite session store")?,
            )
        }
        _ => Arc::new(InMemorySessionStore::new()),
    };
    let orchestrator = Orchestrator::new(Arc::clone(&store), llm, Arc::new(sandbox))
        .with_max_rounds(cfg.agent.max_rounds)
        .with_max_output_tokens(cfg.llm.max_output_tokens);

    let session = store
        .create_session(NewSession {
            tenant_id: "local".to_string(),
            user_id: None,
            traits: None,
        })
        .await
        .context("Failed to create session")?;
    tracing::info!(session_id = %session.id, root = %root.display(), "ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"> ").await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;
            continue;
        }
        if input == "/quit" {
            break;
        }

        match orchestrator
            .handle_user_message(&session.id, input, CancellationToken::new())
            .await
        {
            Ok(reply) => {
                stdout
                    .write_all(format!("{}\n> ", reply.content).as_bytes())
                    .await?;
            }
            Err(e) => {
                stdout
                    .write_all(format!("error: {e}\n> ").as_bytes())
                    .await?;
            }
        }
        stdout.flush().await?;
    }

    Ok(())
}
