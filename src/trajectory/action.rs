//! 动作格式化
//!
//! 把 (工具名, 参数) 规整为一条 `<subject> -> VERB[: value]` 记录。纯函数、全函数：任何输入都有输出。
//! 动词按工具名（不区分大小写）子串依次匹配：close/quit、click、type/fill、select、scroll、hover、navigate/goto，
//! 都不命中时使用大写的工具名。

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// 动作动词
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Click,
    Type,
    Select,
    Scroll,
    Hover,
    Navigate,
    Close,
    Generic(String),
}

impl Verb {
    pub fn label(&self) -> &str {
        match self {
            Verb::Click => "CLICK",
            Verb::Type => "TYPE",
            Verb::Select => "SELECT",
            Verb::Scroll => "SCROLL",
            Verb::Hover => "HOVER",
            Verb::Navigate => "GOTO",
            Verb::Close => "BROWSER_CLOSE",
            Verb::Generic(name) => name,
        }
    }

    /// 按工具名归类
    pub fn classify(tool_name: &str) -> Verb {
        let lower = tool_name.to_lowercase();
        let has = |needle: &str| lower.contains(needle);
        if has("close") || has("quit") {
            Verb::Close
        } else if has("click") {
            Verb::Click
        } else if has("type") || has("fill") {
            Verb::Type
        } else if has("select") {
            Verb::Select
        } else if has("scroll") {
            Verb::Scroll
        } else if has("hover") {
            Verb::Hover
        } else if has("navigate") || has("goto") {
            Verb::Navigate
        } else {
            Verb::Generic(tool_name.to_uppercase())
        }
    }
}

/// 一条动作记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub subject: String,
    pub verb: Verb,
    pub value: Option<String>,
}

impl fmt::Display for ActionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> -> {}", self.subject, self.verb.label())?;
        if let Some(value) = &self.value {
            write!(f, ": {value}")?;
        }
        Ok(())
    }
}

impl Serialize for ActionRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 非空、非 false、非 0、非 null 视为「有值」
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn subject_of(args: &Map<String, Value>) -> String {
    ["element", "ref", "selector", "description"]
        .iter()
        .filter_map(|key| args.get(*key))
        .find(|v| is_present(v))
        .map(render)
        .unwrap_or_else(|| "unknown".to_string())
}

fn select_value(args: &Map<String, Value>) -> String {
    if let Some(value) = args.get("value").filter(|v| is_present(v)) {
        return render(value);
    }
    match args.get("values") {
        Some(Value::Array(items)) if !items.is_empty() => render(&items[0]),
        Some(values) if is_present(values) => render(values),
        _ => String::new(),
    }
}

/// 格式化一次工具调用
pub fn format_action(tool_name: &str, args: &Map<String, Value>) -> ActionRecord {
    let verb = Verb::classify(tool_name);
    let subject = subject_of(args);
    match verb {
        Verb::Close => ActionRecord {
            subject: "unknown".to_string(),
            verb,
            value: None,
        },
        Verb::Type => {
            let text = args
                .get("text")
                .or_else(|| args.get("value"))
                .map(render)
                .unwrap_or_default();
            ActionRecord {
                subject,
                verb,
                value: Some(text),
            }
        }
        Verb::Select => ActionRecord {
            subject,
            value: Some(select_value(args)),
            verb,
        },
        Verb::Scroll => ActionRecord {
            subject,
            value: Some(
                args.get("direction")
                    .map(render)
                    .unwrap_or_else(|| "down".to_string()),
            ),
            verb,
        },
        Verb::Navigate => ActionRecord {
            subject: "navigation".to_string(),
            value: Some(args.get("url").map(render).unwrap_or_default()),
            verb,
        },
        Verb::Click | Verb::Hover | Verb::Generic(_) => ActionRecord {
            subject,
            verb,
            value: None,
        },
    }
}
