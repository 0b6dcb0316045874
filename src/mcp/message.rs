//! JSON-RPC 帧：出站请求 / 通知的构造与入站帧解码
//!
//! 入站一行即一帧：带 id 且含 result / error 的为响应；无 id 带 method 的为通知；
//! 其余（非对象、id 不可解析、既无 id 也无 method）一律视为畸形帧。

use serde::Deserialize;
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// 握手完成后发送的通知
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";
/// 工具进程声明工具列表变化的通知
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    })
}

/// 响应中的 error 对象
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default = "unknown_error")]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

fn unknown_error() -> String {
    "Unknown error".to_string()
}

/// 解码后的入站帧
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// 工具进程主动发起的请求（客户端不支持，仅记录）
    ServerRequest { id: Value, method: String },
}

/// id 可能是数字或数字字符串
fn parse_id(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// 解码一行文本；失败时返回原因（由调用方统一转为 ProtocolReadFailure）
pub fn decode_frame(line: &str) -> Result<Frame, String> {
    let text = line.trim();
    if text.is_empty() {
        return Err("empty frame".to_string());
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(mut obj) = value else {
        return Err("frame is not a JSON object".to_string());
    };

    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);

    match (obj.remove("id"), method) {
        (Some(id), Some(method)) if !id.is_null() => Ok(Frame::ServerRequest { id, method }),
        (Some(id), _) if !id.is_null() => {
            let id = parse_id(&id).ok_or_else(|| format!("unparseable response id: {id}"))?;
            if let Some(error) = obj.remove("error") {
                let error: RpcError = serde_json::from_value(error.clone()).unwrap_or(RpcError {
                    code: None,
                    message: error.to_string(),
                    data: None,
                });
                return Ok(Frame::Response {
                    id,
                    outcome: Err(error),
                });
            }
            let result = obj.remove("result").unwrap_or_else(|| json!({}));
            Ok(Frame::Response {
                id,
                outcome: Ok(result),
            })
        }
        (_, Some(method)) => Ok(Frame::Notification {
            method,
            params: obj.remove("params"),
        }),
        _ => Err("frame has neither id nor method".to_string()),
    }
}
