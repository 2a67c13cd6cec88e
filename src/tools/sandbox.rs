//! 沙箱命令执行器
//!
//! 在受限根目录内以子进程执行白名单检查命令。路径参数解析后必须落在根目录内
//! （规范化比较时根目录带尾分隔符，防止同前缀的兄弟目录通过朴素前缀检查）；
//! 违规在进程启动前即拒绝。执行期间施加合并输出字节上限与墙钟超时：
//! 超限截断并提前杀死子进程，超时杀死并报告 timeout。
//! 执行失败与超时是 ToolResult 数据而非异常，由模型在下一轮消费。

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::session::{ToolResult, ToolStatus};
use crate::tools::manifest;

/// 沙箱执行器：绑定根目录、单次执行超时与合并输出字节上限
#[derive(Debug, Clone)]
pub struct ToolSandbox {
    root: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

/// 执行结局（内部）
enum Outcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    /// 输出超限提前终止（非超时）
    Capped,
}

impl ToolSandbox {
    pub fn new(root: impl AsRef<Path>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            timeout,
            max_output_bytes,
        }
    }

    /// 启动时快速失败：根目录必须是存在的绝对路径目录
    pub fn validate_working_directory(&self) -> Result<(), AgentError> {
        if !self.root.is_absolute() {
            return Err(AgentError::ConfigError(format!(
                "sandbox root must be absolute: {}",
                self.root.display()
            )));
        }
        if !self.root.is_dir() {
            return Err(AgentError::ConfigError(format!(
                "sandbox root is not an existing directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn canonical_root(&self) -> Result<PathBuf, AgentError> {
        self.root.canonicalize().map_err(|e| {
            AgentError::ConfigError(format!(
                "cannot canonicalize sandbox root {}: {e}",
                self.root.display()
            ))
        })
    }

    /// 校验单个路径参数落在沙箱内
    fn contain_path(&self, arg: &str) -> Result<(), AgentError> {
        let resolved = if Path::new(arg).is_absolute() {
            PathBuf::from(arg)
        } else {
            self.root.join(arg)
        };
        // 目标不存在时无法 canonicalize，退化为词法归一化（.. / . 消解）
        let canonical = resolved
            .canonicalize()
            .unwrap_or_else(|_| normalize_lexically(&resolved));
        let root = self.canonical_root()?;

        let mut prefix = root.to_string_lossy().into_owned();
        if !prefix.ends_with(MAIN_SEPARATOR) {
            prefix.push(MAIN_SEPARATOR);
        }
        let candidate = canonical.to_string_lossy();
        if candidate.as_ref() == root.to_string_lossy().as_ref() || candidate.starts_with(&prefix) {
            Ok(())
        } else {
            Err(AgentError::PathEscape(arg.to_string()))
        }
    }

    /// 校验全部参数：flag 跳过；模式搜索命令的首个非 flag 参数是模式，也跳过
    fn check_args(&self, command: &str, args: &[String]) -> Result<(), AgentError> {
        let mut pattern_pending = manifest::is_pattern_search(command);
        for arg in args {
            if arg.starts_with('-') {
                continue;
            }
            if pattern_pending {
                pattern_pending = false;
                continue;
            }
            self.contain_path(arg)?;
        }
        Ok(())
    }

    /// 执行白名单命令；结构性失败（白名单外、路径逃逸）抛错，运行失败落入 ToolResult
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        if !manifest::is_allowed(command) {
            return Err(AgentError::CommandNotAllowed(command.to_string()));
        }
        self.check_args(command, args)?;
        let root = self.canonical_root()?;

        let start = Instant::now();
        let spawned = Command::new(command)
            .args(args)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(c) => c,
            // 启动失败（如命令未安装）是运行环境问题，作为数据返回
            Err(e) => {
                return Ok(ToolResult {
                    status: ToolStatus::Error,
                    stdout: None,
                    stderr: None,
                    exit_code: None,
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                    truncated: false,
                    error_message: Some(format!("failed to spawn {command}: {e}")),
                    metadata: None,
                });
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut out_chunk = [0u8; 4096];
        let mut err_chunk = [0u8; 4096];
        let mut out_done = stdout_pipe.is_none();
        let mut err_done = stderr_pipe.is_none();
        let mut truncated = false;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(AgentError::Cancelled);
                }
                _ = &mut deadline => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break Outcome::TimedOut;
                }
                n = read_some(&mut stdout_pipe, &mut out_chunk), if !out_done => {
                    match n {
                        Some(n) if n > 0 => stdout_buf.extend_from_slice(&out_chunk[..n]),
                        _ => out_done = true,
                    }
                }
                n = read_some(&mut stderr_pipe, &mut err_chunk), if !err_done => {
                    match n {
                        Some(n) if n > 0 => stderr_buf.extend_from_slice(&err_chunk[..n]),
                        _ => err_done = true,
                    }
                }
                status = child.wait(), if out_done && err_done => {
                    match status {
                        Ok(s) => break Outcome::Completed(s),
                        Err(e) => {
                            return Ok(ToolResult {
                                status: ToolStatus::Error,
                                stdout: Some(String::from_utf8_lossy(&stdout_buf).into_owned()),
                                stderr: Some(String::from_utf8_lossy(&stderr_buf).into_owned()),
                                exit_code: None,
                                duration_ms: Some(start.elapsed().as_millis() as u64),
                                truncated,
                                error_message: Some(format!("wait failed: {e}")),
                                metadata: None,
                            });
                        }
                    }
                }
            }

            // 合并字节上限：超限即截断到上限并提前杀死（区别于超时）
            let total = stdout_buf.len() + stderr_buf.len();
            if total > self.max_output_bytes {
                let overflow = total - self.max_output_bytes;
                if stderr_buf.len() >= overflow {
                    stderr_buf.truncate(stderr_buf.len() - overflow);
                } else {
                    let from_stdout = overflow - stderr_buf.len();
                    stderr_buf.clear();
                    stdout_buf.truncate(stdout_buf.len() - from_stdout);
                }
                truncated = true;
                let _ = child.start_kill();
                let _ = child.wait().await;
                break Outcome::Capped;
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

        let result = match outcome {
            Outcome::Completed(status) => {
                let exit_code = status.code();
                if status.success() {
                    ToolResult {
                        status: ToolStatus::Success,
                        stdout: Some(stdout),
                        stderr: none_if_empty(stderr),
                        exit_code,
                        duration_ms: Some(duration_ms),
                        truncated,
                        error_message: None,
                        metadata: None,
                    }
                } else {
                    // 无 stderr 的非零退出合成错误信息，模型才有线索
                    let error_message = if stderr.trim().is_empty() {
                        Some(match exit_code {
                            Some(code) => format!("{command} exited with code {code}"),
                            None => format!("{command} was terminated by a signal"),
                        })
                    } else {
                        Some(stderr.trim().to_string())
                    };
                    ToolResult {
                        status: ToolStatus::Error,
                        stdout: Some(stdout),
                        stderr: none_if_empty(stderr),
                        exit_code,
                        duration_ms: Some(duration_ms),
                        truncated,
                        error_message,
                        metadata: None,
                    }
                }
            }
            Outcome::TimedOut => ToolResult {
                status: ToolStatus::Timeout,
                stdout: none_if_empty(stdout),
                stderr: none_if_empty(stderr),
                exit_code: None,
                duration_ms: Some(duration_ms),
                truncated,
                error_message: Some(format!(
                    "{command} timed out after {}ms",
                    self.timeout.as_millis()
                )),
                metadata: None,
            },
            Outcome::Capped => ToolResult {
                status: ToolStatus::Success,
                stdout: Some(stdout),
                stderr: none_if_empty(stderr),
                exit_code: None,
                duration_ms: Some(duration_ms),
                truncated: true,
                error_message: None,
                metadata: None,
            },
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "command": command,
            "outcome": result.status.as_str(),
            "truncated": result.truncated,
            "duration_ms": duration_ms,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        Ok(result)
    }
}

/// 从可选管道读取一块；管道缺失或读错误按 EOF 处理
async fn read_some(
    pipe: &mut Option<impl tokio::io::AsyncRead + Unpin>,
    buf: &mut [u8],
) -> Option<usize> {
    match pipe {
        Some(p) => p.read(buf).await.ok(),
        None => None,
    }
}

/// 词法归一化：消解 . 与 ..，不访问文件系统
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn args_preview(args: &[String]) -> String {
    let joined = args.join(" ");
    if joined.len() > 200 {
        format!("{}...", joined.chars().take(200).collect::<String>())
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox(root: &Path) -> ToolSandbox {
        ToolSandbox::new(root, Duration::from_secs(5), 64 * 1024)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_echo_success() {
        let dir = TempDir::new().unwrap();
        let result = sandbox(dir.path())
            .execute("echo", &["hello".to_string()], &token())
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.as_deref(), Some("hello\n"));
        assert!(!result.truncated);
        assert!(result.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_relative_escape_rejected_before_spawn() {
        let dir = TempDir::new().unwrap();
        let err = sandbox(dir.path())
            .execute("cat", &["../../etc/passwd".to_string()], &token())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_absolute_escape_rejected_before_spawn() {
        let dir = TempDir::new().unwrap();
        let err = sandbox(dir.path())
            .execute("cat", &["/etc/passwd".to_string()], &token())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_sibling_prefix_dir_rejected() {
        // root=/.../work，兄弟目录 /.../workx 仅共享名字前缀，必须拒绝
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("work");
        let sibling = parent.path().join("workx");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&sibling).unwrap();
        std::fs::write(sibling.join("secret.txt"), "top secret").unwrap();

        let err = sandbox(&root)
            .execute("cat", &["../workx/secret.txt".to_string()], &token())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_grep_pattern_is_not_a_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "needle here\n").unwrap();
        // 模式含 ../ 也不做路径校验；文件参数正常校验
        let result = sandbox(dir.path())
            .execute(
                "grep",
                &["../needle".to_string(), "a.txt".to_string()],
                &token(),
            )
            .await
            .unwrap();
        // 无匹配退出码 1，但这是执行结果而非结构性错误
        assert_eq!(result.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn test_nonzero_exit_synthesizes_error_message() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let result = sandbox(dir.path())
            .execute(
                "grep",
                &["zzz".to_string(), "a.txt".to_string()],
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.exit_code, Some(1));
        let msg = result.error_message.unwrap();
        assert!(msg.contains("exited with code 1"), "msg: {msg}");
    }

    #[tokio::test]
    async fn test_output_cap_truncates_and_kills() {
        let dir = TempDir::new().unwrap();
        let long = "x".repeat(200);
        let sandbox = ToolSandbox::new(dir.path(), Duration::from_secs(5), 100);
        let result = sandbox
            .execute("echo", &[long], &token())
            .await
            .unwrap();
        assert!(result.truncated);
        assert!(result.stdout.unwrap().len() <= 100);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "line\n").unwrap();
        let sandbox = ToolSandbox::new(dir.path(), Duration::from_millis(300), 64 * 1024);
        let result = sandbox
            .execute("tail", &["-f".to_string(), "f.txt".to_string()], &token())
            .await
            .unwrap();
        assert_eq!(result.status, ToolStatus::Timeout);
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disallowed_command_rejected() {
        let dir = TempDir::new().unwrap();
        let err = sandbox(dir.path())
            .execute("rm", &["-rf".to_string(), ".".to_string()], &token())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CommandNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_completion() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "line\n").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sandbox(dir.path())
            .execute("tail", &["-f".to_string(), "f.txt".to_string()], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[test]
    fn test_validate_working_directory() {
        let dir = TempDir::new().unwrap();
        assert!(sandbox(dir.path()).validate_working_directory().is_ok());

        let relative = ToolSandbox::new("workspace", Duration::from_secs(1), 1024);
        assert!(relative.validate_working_directory().is_err());

        let missing = ToolSandbox::new("/no/such/dir/anywhere", Duration::from_secs(1), 1024);
        assert!(missing.validate_working_directory().is_err());
    }
}
