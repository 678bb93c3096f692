//! Parsing for the executor's `stream-json` stdout protocol: one JSON object
//! per line, describing assistant turns, tool use, and the final result.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<ToolUseResult>,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
pub struct ToolUseResult {
    #[serde(default)]
    pub file: Option<FileInfo>,
}

#[derive(Debug, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "filePath")]
    pub file_path: String,
}

/// A short human-readable description of a tool call, for the per-job log.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    match name {
        "Read" => format!("reading {}", path_arg(input, "file_path")),
        "Write" => format!("writing {}", path_arg(input, "file_path")),
        "Edit" => format!("editing {}", path_arg(input, "file_path")),
        "Bash" => format!(
            "running: {}",
            truncate(input.get("command").and_then(|v| v.as_str()).unwrap_or(""), 60)
        ),
        "Glob" => format!(
            "searching {}",
            input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*")
        ),
        "Grep" => format!(
            "grep {}",
            truncate(input.get("pattern").and_then(|v| v.as_str()).unwrap_or(""), 40)
        ),
        _ => name.to_string(),
    }
}

fn path_arg(input: &Value, key: &str) -> String {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("<unknown>")
        .to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
