//! 工具清单：编译期固定的只读检查命令表
//!
//! 以供应商中立的 {name, description, input_schema} 形态暴露给模型；
//! 参数 schema 用 schemars 从共享的 CommandArgs 结构生成，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Value};

use crate::llm::ToolSpec;

/// 白名单命令与给模型看的描述；运行期不可扩展
const COMMANDS: &[(&str, &str)] = &[
    ("ls", "List directory contents. Args: [path] (default '.')"),
    ("cat", "Print file contents. Args: [file...]"),
    (
        "grep",
        "Search file contents for a pattern. Args: [pattern, path...]; first non-flag arg is the pattern",
    ),
    (
        "rg",
        "Fast recursive pattern search. Args: [pattern, path...]; first non-flag arg is the pattern",
    ),
    ("head", "Print the first lines of a file. Args: [-n N, file]"),
    ("tail", "Print the last lines of a file. Args: [-n N, file]"),
    ("wc", "Count lines, words and bytes. Args: [file...]"),
    ("find", "Look up paths under a directory. Args: [path, flags...]"),
    ("echo", "Echo text back (for testing). Args: [text...]"),
    ("pwd", "Print the sandbox working directory. Args: []"),
];

/// 所有工具共享的参数格式（仅用于 Schema 生成）
#[derive(JsonSchema)]
#[allow(dead_code)]
struct CommandArgs {
    /// 命令行参数；路径必须位于沙箱根目录之内
    pub args: Vec<String>,
}

fn input_schema() -> Value {
    serde_json::to_value(schema_for!(CommandArgs)).unwrap_or_else(|_| json!({"type": "object"}))
}

/// 固定工具清单，每次调用都随历史一并交给模型
pub fn tool_manifest() -> Vec<ToolSpec> {
    let schema = input_schema();
    COMMANDS
        .iter()
        .map(|(name, description)| ToolSpec {
            name: (*name).to_string(),
            description: (*description).to_string(),
            input_schema: schema.clone(),
        })
        .collect()
}

pub fn is_allowed(command: &str) -> bool {
    COMMANDS.iter().any(|(name, _)| *name == command)
}

/// 模式搜索类命令：首个非 flag 参数是搜索模式而非路径
pub fn is_pattern_search(command: &str) -> bool {
    matches!(command, "grep" | "rg")
}
