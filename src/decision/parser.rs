//! 决策回复解析
//!
//! 依次尝试：`<json>...</json>` 标签、```json 代码块或裸 JSON 对象、`THOUGHT:` / `ACTION:`|`TOOL:` / `PARAMS:` 行格式；
//! 都不成功时返回 Decision::Invalid。缺少 tool 视为 finish；params 也接受 args 作为别名。

use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::decision::types::Decision;

/// 回复中 JSON 的结构（同时用于生成 prompt 中的 Schema）
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct DecisionFormat {
    /// 对当前页面与下一步的推理
    #[serde(default)]
    pub thought: Option<String>,
    /// 工具名（来自 AVAILABLE TOOLS），结束时为 "finish"
    #[serde(default)]
    pub tool: Option<String>,
    /// 工具参数，键与 AVAILABLE TOOLS 中声明的字段一致
    #[serde(default, alias = "args")]
    pub params: Option<Map<String, Value>>,
}

const RAW_PREVIEW_CHARS: usize = 1000;

fn json_tag() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<json>(.*?)</json>").ok())
        .as_ref()
}

fn preview(text: &str) -> String {
    text.chars().take(RAW_PREVIEW_CHARS).collect()
}

fn is_terminal(tool: &str) -> bool {
    matches!(tool.trim().to_lowercase().as_str(), "finish" | "stop")
}

impl DecisionFormat {
    fn into_decision(self, raw: &str) -> Decision {
        let thought = self
            .thought
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "No thought provided".to_string());
        let tool = self
            .tool
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "finish".to_string());
        if is_terminal(&tool) {
            return Decision::Finish { thought };
        }
        if tool.eq_ignore_ascii_case("error") {
            return Decision::Invalid {
                reason: "decision reported an error instead of an action".to_string(),
                raw: preview(raw),
            };
        }
        Decision::Act {
            thought,
            tool,
            args: self.params.unwrap_or_default(),
        }
    }
}

fn from_json_text(text: &str) -> Option<DecisionFormat> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// 未加标签的 JSON 至少要带 tool 或 thought，避免把 PARAMS 行里的参数对象当成决策
fn from_untagged_json(text: &str) -> Option<DecisionFormat> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("tool") && !obj.contains_key("thought") {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// ```json 代码块，或第一个 '{' 到最后一个 '}'
fn embedded_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn from_lines(text: &str) -> Result<Option<DecisionFormat>, String> {
    let mut format = DecisionFormat::default();
    let mut matched = false;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("THOUGHT:") {
            format.thought = Some(rest.trim().to_string());
            matched = true;
        } else if let Some(rest) = line
            .strip_prefix("ACTION:")
            .or_else(|| line.strip_prefix("TOOL:"))
        {
            format.tool = Some(rest.trim().to_string());
            matched = true;
        } else if let Some(rest) = line.strip_prefix("PARAMS:") {
            let params: Map<String, Value> = serde_json::from_str(rest.trim())
                .map_err(|e| format!("PARAMS is not a JSON object: {e}"))?;
            format.params = Some(params);
            matched = true;
        }
    }
    Ok(matched.then_some(format))
}

/// 解析一条决策回复（全函数：无法理解时返回 Invalid）
pub fn parse_decision(text: &str) -> Decision {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Decision::Invalid {
            reason: "empty response".to_string(),
            raw: String::new(),
        };
    }

    if let Some(caps) = json_tag().and_then(|re| re.captures(trimmed)) {
        if let Some(format) = caps.get(1).and_then(|m| from_json_text(m.as_str())) {
            return format.into_decision(trimmed);
        }
        tracing::debug!("<json> block present but not a valid decision object");
    }

    if let Some(format) = embedded_json(trimmed).and_then(from_untagged_json) {
        return format.into_decision(trimmed);
    }

    match from_lines(trimmed) {
        Ok(Some(format)) => format.into_decision(trimmed),
        Ok(None) => {
            tracing::warn!(response = %preview(trimmed), "could not parse decision response");
            Decision::Invalid {
                reason: "parse_failure".to_string(),
                raw: preview(trimmed),
            }
        }
        Err(reason) => Decision::Invalid {
            reason,
            raw: preview(trimmed),
        },
    }
}
