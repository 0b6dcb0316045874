//! 决策 prompt 构建
//!
//! system prompt 固定（角色 + 回复格式 + 由 schemars 生成的 JSON Schema）；
//! 每步的 user 消息包含能力列表与页面快照，第一步额外包含任务说明，失败后的下一步带上错误反馈。

use schemars::schema_for;

use crate::decision::parser::DecisionFormat;
use crate::decision::types::DecisionRequest;
use crate::tools::render_tool_catalog;

/// 快照截断标记
pub const TRUNCATION_MARKER: &str = "\n\n[Snapshot truncated for length...]";

/// 回复格式的 JSON Schema 字符串
pub fn decision_schema_json() -> String {
    let schema = schema_for!(DecisionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

pub fn system_prompt() -> String {
    format!(
        r#"You are a web automation agent. You operate a browser only through the tools listed in AVAILABLE TOOLS.
Each turn you receive the current page snapshot and must choose exactly one tool call.

CRITICAL - RESPONSE FORMAT:
Respond with JSON wrapped in <json></json> tags:

<json>
{{
    "thought": "Your reasoning about what to do next",
    "tool": "tool_name",
    "params": {{"param_name": "param_value"}}
}}
</json>

The JSON must match this schema:
{schema}

Most interactive tools need both "element" (a human-readable description such as "Search textbox")
and "ref" (the snapshot reference such as "s8").
When the task is complete, respond with "tool": "finish" and empty params."#,
        schema = decision_schema_json()
    )
}

/// 按字符数截断快照（在字符边界上），超出时追加标记
pub fn truncate_snapshot(snapshot: &str, max_chars: usize) -> String {
    match snapshot.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &snapshot[..cut], TRUNCATION_MARKER),
        None => snapshot.to_string(),
    }
}

/// 单步 user 消息
pub fn step_prompt(request: &DecisionRequest) -> String {
    let catalog = render_tool_catalog(&request.tools);
    let mut out = String::new();

    if let Some(task) = &request.task {
        out.push_str(&format!("TASK: {}\n\n", task.description.trim()));
        if let Some(website) = task.website.as_deref().filter(|w| !w.is_empty()) {
            out.push_str(&format!("You are currently on the website: {website}\n\n"));
        }
    }

    if let Some(feedback) = &request.feedback {
        out.push_str(&format!(
            "ERROR IN PREVIOUS RESPONSE:\n{}\n\nPlease try again with the correct format. Remember to wrap your JSON in <json></json> tags.\n\n",
            feedback.trim()
        ));
    }

    out.push_str(&catalog);
    out.push_str(&format!("\nCURRENT PAGE SNAPSHOT:\n{}\n", request.snapshot));
    if request.task.is_none() {
        out.push_str("\nWhat should we do next?");
    }
    out
}
