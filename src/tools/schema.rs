//! 工具描述与参数校验
//!
//! ToolDescriptor 来自工具进程 tools/list 的返回（name / description / inputSchema），运行期加载；
//! validate_arguments 只检查必填键与已声明键的原始类型，未声明的键直接放行。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 工具进程声明的一个能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: InputSchema,
}

/// 参数结构描述：必填字段名 + 每个字段的 JSON Schema 片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// JSON Schema 原始类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl PrimitiveKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().map_or(false, |f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Null => value.is_null(),
        }
    }
}

/// 用于错误信息中的值类型名
fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl InputSchema {
    /// 字段声明的类型名列表（"type" 可为字符串或字符串数组）
    pub fn declared_types(&self, field: &str) -> Vec<String> {
        match self.properties.get(field).and_then(|p| p.get("type")) {
            Some(Value::String(t)) => vec![t.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn field_description(&self, field: &str) -> Option<&str> {
        self.properties
            .get(field)
            .and_then(|p| p.get("description"))
            .and_then(|d| d.as_str())
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required.iter().any(|r| r == field)
    }
}

impl ToolDescriptor {
    /// 校验参数；返回描述性错误（不含工具名，调用方负责拼接）
    pub fn validate_arguments(&self, arguments: &Map<String, Value>) -> Result<(), String> {
        let schema = &self.input_schema;
        for field in &schema.required {
            if !arguments.contains_key(field) {
                return Err(format!("Missing required field: '{field}'"));
            }
        }

        for (name, value) in arguments {
            if !schema.properties.contains_key(name) {
                tracing::debug!(tool = %self.name, arg = %name, "argument not in schema, allowing");
                continue;
            }
            let declared = schema.declared_types(name);
            let kinds: Vec<PrimitiveKind> =
                declared.iter().filter_map(|t| PrimitiveKind::parse(t)).collect();
            if kinds.is_empty() {
                continue;
            }
            if !kinds.iter().any(|k| k.matches(value)) {
                return Err(format!(
                    "Type mismatch for '{}': expected {}, got {}",
                    name,
                    declared.join(" | "),
                    value_kind(value)
                ));
            }
        }
        Ok(())
    }

    /// 供决策方阅读的单个工具说明（名称、描述、每个字段的类型与是否必填）
    pub fn render_for_prompt(&self) -> String {
        let mut out = format!("- {}: {}", self.name, self.description.trim());
        let schema = &self.input_schema;
        if schema.properties.is_empty() {
            out.push_str("\n  Parameters: none");
            return out;
        }
        out.push_str("\n  Parameters:");
        for name in schema.properties.keys() {
            let types = schema.declared_types(name);
            let type_label = if types.is_empty() {
                "any".to_string()
            } else {
                types.join(" | ")
            };
            let marker = if schema.is_required(name) {
                "required"
            } else {
                "optional"
            };
            out.push_str(&format!("\n    - {name}: {type_label} ({marker})"));
            if let Some(desc) = schema.field_description(name) {
                if !desc.trim().is_empty() {
                    out.push_str(&format!("\n      {}", desc.trim()));
                }
            }
        }
        out
    }
}

/// 整个能力列表的 prompt 段落
pub fn render_tool_catalog(tools: &[ToolDescriptor]) -> String {
    let mut out = String::from("AVAILABLE TOOLS:\n");
    for tool in tools {
        out.push_str(&tool.render_for_prompt());
        out.push('\n');
    }
    out
}
