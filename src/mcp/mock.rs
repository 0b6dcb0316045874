//! 内存中的模拟工具进程
//!
//! MockProvider 实现一个最小的行分隔 JSON-RPC 服务端（initialize / tools/list / tools/call），
//! 自带一组浏览器风格的工具；可对指定工具或方法预置回复（延迟、静默、错误、原始帧）。
//! 输入在独立的读取循环中接收，请求按到达顺序逐个处理；journal 记录收到与回复的先后。
//! MockLauncher 通过 tokio duplex 把它接到 ProtocolClient 上；trailmark-mock-provider 二进制则把它接到 stdio。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::core::ClientError;
use crate::mcp::launcher::{LaunchContext, Launched, Launcher};
use crate::mcp::transport::Transport;

/// 1x1 PNG
pub const TINY_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// 预置回复
#[derive(Debug, Clone)]
pub enum MockReply {
    /// 正常 result
    Result(Value),
    /// JSON-RPC error 响应
    Error(String),
    /// 延迟后回复 result
    Delayed(Duration, Value),
    /// 不回复
    Silent,
    /// result 中 isError = true
    ToolError(String),
    /// 原样写出的若干行，其中 "{id}" 替换为请求 id
    Lines(Vec<String>),
    /// 原样写出的一行字节（可以不是 UTF-8）
    Raw(Vec<u8>),
}

/// journal 中的一条记录；key 为工具名（tools/call）或方法名
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Received(String),
    Replied(String),
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    tools: Arc<Mutex<Vec<Value>>>,
    scripted: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    received: Arc<Mutex<Vec<Value>>>,
    journal: Arc<Mutex<Vec<MockEvent>>>,
    location: Arc<Mutex<String>>,
    page_size: Option<usize>,
    fail_initialize: bool,
}

impl MockProvider {
    /// 空工具集
    pub fn new() -> Self {
        Self::default()
    }

    /// 浏览器风格的工具集
    pub fn browser() -> Self {
        let provider = Self::new();
        provider.set_tools(browser_tools());
        *lock(&provider.location) = "about:blank".to_string();
        provider
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// 为工具名（tools/call）或方法名预置一次回复，按先进先出消费
    pub fn with_reply(self, key: &str, reply: MockReply) -> Self {
        self.push_reply(key, reply);
        self
    }

    pub fn push_reply(&self, key: &str, reply: MockReply) {
        lock(&self.scripted)
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *lock(&self.tools) = tools;
    }

    /// 收到的全部帧（含通知）
    pub fn received(&self) -> Vec<Value> {
        lock(&self.received).clone()
    }

    /// 收到的 tools/call：(工具名, 参数)
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.received)
            .iter()
            .filter(|f| f.get("method").and_then(|m| m.as_str()) == Some("tools/call"))
            .map(|f| {
                let params = f.get("params").cloned().unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                (name, args)
            })
            .collect()
    }

    /// 收到请求与写出回复的先后顺序
    pub fn journal(&self) -> Vec<MockEvent> {
        lock(&self.journal).clone()
    }

    pub fn methods(&self) -> Vec<String> {
        lock(&self.received)
            .iter()
            .filter_map(|f| f.get("method").and_then(|m| m.as_str()).map(String::from))
            .collect()
    }

    /// 接收与处理分开：读取循环记录每一帧的到达，处理循环按顺序逐个回复
    pub async fn serve<R, W>(self, reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let intake = {
            let provider = self.clone();
            async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    if let Some(key) = request_key(&frame) {
                        lock(&provider.journal).push(MockEvent::Received(key));
                    }
                    lock(&provider.received).push(frame.clone());
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            }
        };

        let respond = async {
            while let Some(frame) = rx.recv().await {
                let Some(method) = frame.get("method").and_then(|m| m.as_str()) else {
                    continue;
                };
                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));

                let reply = self.reply_for(method, &params).await;
                let out: Vec<Vec<u8>> = match reply {
                    MockReply::Result(result) => {
                        vec![json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string().into_bytes()]
                    }
                    MockReply::Error(message) => vec![json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32000, "message": message}
                    })
                    .to_string()
                    .into_bytes()],
                    MockReply::Delayed(delay, result) => {
                        tokio::time::sleep(delay).await;
                        vec![json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string().into_bytes()]
                    }
                    MockReply::Silent => Vec::new(),
                    MockReply::ToolError(message) => vec![json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"content": [{"type": "text", "text": message}], "isError": true}
                    })
                    .to_string()
                    .into_bytes()],
                    MockReply::Lines(lines) => {
                        let id_text = match &id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        lines
                            .iter()
                            .map(|l| l.replace("{id}", &id_text).into_bytes())
                            .collect()
                    }
                    MockReply::Raw(bytes) => vec![bytes],
                };
                if out.is_empty() {
                    continue;
                }
                if let Some(key) = request_key(&frame) {
                    lock(&self.journal).push(MockEvent::Replied(key));
                }
                for line in out {
                    if writer.write_all(&line).await.is_err() || writer.write_all(b"\n").await.is_err() {
                        return;
                    }
                }
                if writer.flush().await.is_err() {
                    return;
                }
            }
        };

        tokio::join!(intake, respond);
    }

    fn take_scripted(&self, key: &str) -> Option<MockReply> {
        lock(&self.scripted).get_mut(key).and_then(|q| q.pop_front())
    }

    async fn reply_for(&self, method: &str, params: &Value) -> MockReply {
        let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
        let key = if method == "tools/call" { tool_name } else { method };
        if let Some(reply) = self.take_scripted(key) {
            return reply;
        }

        match method {
            "initialize" if self.fail_initialize => MockReply::Error("initialize rejected".into()),
            "initialize" => MockReply::Result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "trailmark-mock-provider", "version": env!("CARGO_PKG_VERSION")}
            })),
            "tools/list" => MockReply::Result(self.tools_page(params)),
            "tools/call" => {
                let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                self.call_tool(tool_name, &args).await
            }
            "ping" => MockReply::Result(json!({})),
            other => MockReply::Error(format!("Method not found: {other}")),
        }
    }

    fn tools_page(&self, params: &Value) -> Value {
        let tools = lock(&self.tools).clone();
        let Some(size) = self.page_size else {
            return json!({ "tools": tools });
        };
        let offset = params
            .get("cursor")
            .and_then(|c| c.as_str())
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + size).min(tools.len());
        let page: Vec<Value> = tools.get(offset..end).map(|s| s.to_vec()).unwrap_or_default();
        if end < tools.len() {
            json!({ "tools": page, "nextCursor": end.to_string() })
        } else {
            json!({ "tools": page })
        }
    }

    async fn call_tool(&self, name: &str, args: &Value) -> MockReply {
        let text = |t: String| MockReply::Result(json!({"content": [{"type": "text", "text": t}]}));
        let field = |k: &str| args.get(k).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        match name {
            "browser_navigate" => {
                let url = field("url");
                *lock(&self.location) = url.clone();
                text(format!("Navigated to {url}"))
            }
            "browser_snapshot" => {
                let location = lock(&self.location).clone();
                text(format!(
                    "- Page URL: {location}\n- textbox \"Destination\" [ref=s8]\n- button \"Search\" [ref=s12]"
                ))
            }
            "browser_take_screenshot" => MockReply::Result(json!({
                "content": [{"type": "image", "data": TINY_PNG_BASE64, "mimeType": "image/png"}]
            })),
            "browser_wait_for" => {
                let secs = args.get("time").and_then(|t| t.as_f64()).unwrap_or(0.0);
                if let Ok(wait) = Duration::try_from_secs_f64(secs) {
                    tokio::time::sleep(wait).await;
                }
                text(format!("Waited for {secs}s"))
            }
            "browser_click" => text(format!("Clicked {}", field("ref"))),
            "browser_type" => text(format!("Typed into {}", field("ref"))),
            "browser_select_option" => text(format!("Selected option in {}", field("ref"))),
            "browser_hover" => text(format!("Hovered {}", field("ref"))),
            "browser_close" => text("Browser closed".to_string()),
            "browser_install" => text("Browser is installed".to_string()),
            other => MockReply::ToolError(format!("Unknown tool: {other}")),
        }
    }
}

/// 请求帧的 journal key；通知与响应返回 None
fn request_key(frame: &Value) -> Option<String> {
    frame.get("id")?;
    let method = frame.get("method")?.as_str()?;
    if method == "tools/call" {
        let name = frame.pointer("/params/name").and_then(|n| n.as_str())?;
        return Some(name.to_string());
    }
    Some(method.to_string())
}

/// 准备工具描述（不在默认工具集中）
pub fn install_tool() -> Value {
    json!({
        "name": "browser_install",
        "description": "Install the browser specified in the config",
        "inputSchema": {"type": "object", "properties": {}}
    })
}

fn element_ref_schema(extra: Value, mut required: Vec<&str>) -> Value {
    let mut properties = json!({
        "element": {"type": "string", "description": "Human-readable element description"},
        "ref": {"type": "string", "description": "Exact target element reference from the page snapshot"}
    });
    if let (Some(base), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    let mut req = vec!["element", "ref"];
    req.append(&mut required);
    json!({"type": "object", "properties": properties, "required": req})
}

/// 浏览器风格工具描述
pub fn browser_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "browser_navigate",
            "description": "Navigate to a URL",
            "inputSchema": {
                "type": "object",
                "properties": {"url": {"type": "string", "description": "The URL to navigate to"}},
                "required": ["url"]
            }
        }),
        json!({
            "name": "browser_snapshot",
            "description": "Capture accessibility snapshot of the current page",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "browser_take_screenshot",
            "description": "Take a screenshot of the current page",
            "inputSchema": {
                "type": "object",
                "properties": {"type": {"type": "string", "description": "Image format, png or jpeg"}}
            }
        }),
        json!({
            "name": "browser_click",
            "description": "Perform click on a web page",
            "inputSchema": element_ref_schema(json!({"doubleClick": {"type": "boolean"}}), vec![])
        }),
        json!({
            "name": "browser_type",
            "description": "Type text into editable element",
            "inputSchema": element_ref_schema(
                json!({"text": {"type": "string"}, "submit": {"type": "boolean"}}),
                vec!["text"]
            )
        }),
        json!({
            "name": "browser_select_option",
            "description": "Select an option in a dropdown",
            "inputSchema": element_ref_schema(json!({"values": {"type": "array"}}), vec!["values"])
        }),
        json!({
            "name": "browser_hover",
            "description": "Hover over element on page",
            "inputSchema": element_ref_schema(json!({}), vec![])
        }),
        json!({
            "name": "browser_wait_for",
            "description": "Wait for a number of seconds",
            "inputSchema": {
                "type": "object",
                "properties": {"time": {"type": "number", "description": "Seconds to wait"}}
            }
        }),
        json!({
            "name": "browser_close",
            "description": "Close the page",
            "inputSchema": {"type": "object", "properties": {}}
        }),
    ]
}

/// 通过内存 duplex 接入 MockProvider 的 Launcher
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    provider: MockProvider,
    startup_error: Option<String>,
    launches: Arc<AtomicUsize>,
}

impl MockLauncher {
    pub fn new(provider: MockProvider) -> Self {
        Self {
            provider,
            startup_error: None,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// launch() 直接返回 StartupFailure
    pub fn failing(message: &str) -> Self {
        Self {
            startup_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn provider(&self) -> &MockProvider {
        &self.provider
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, ctx: &LaunchContext) -> Result<Launched, ClientError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.startup_error {
            return Err(ClientError::StartupFailure(message.clone()));
        }
        tracing::debug!(instance = %ctx.instance_id, "launching in-memory provider");
        let (client_side, provider_side) = tokio::io::duplex(64 * 1024);
        let (provider_read, provider_write) = tokio::io::split(provider_side);
        tokio::spawn(self.provider.clone().serve(provider_read, provider_write));
        let (client_read, client_write) = tokio::io::split(client_side);
        Ok(Launched {
            transport: Transport::new(Box::new(client_read), Box::new(client_write)),
            process: None,
            scratch_dir: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDescriptor;

    #[test]
    fn test_browser_tools_parse_as_descriptors() {
        for tool in browser_tools() {
            let descriptor: ToolDescriptor = serde_json::from_value(tool).unwrap();
            assert!(descriptor.name.starts_with("browser_"));
        }
    }

    #[test]
    fn test_pagination_splits_tool_list() {
        let provider = MockProvider::browser().with_page_size(4);
        let first = provider.tools_page(&json!({}));
        assert_eq!(first["tools"].as_array().unwrap().len(), 4);
        assert_eq!(first["nextCursor"], "4");
        let last = provider.tools_page(&json!({"cursor": "8"}));
        assert_eq!(last["tools"].as_array().unwrap().len(), 1);
        assert!(last.get("nextCursor").is_none());
    }

    #[test]
    fn test_request_key_skips_notifications() {
        let call = json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "browser_click"}});
        assert_eq!(request_key(&call).as_deref(), Some("browser_click"));
        let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        assert_eq!(request_key(&init).as_deref(), Some("initialize"));
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        assert!(request_key(&note).is_none());
    }

    #[tokio::test]
    async fn test_scripted_reply_takes_precedence() {
        let provider = MockProvider::browser().with_reply("browser_click", MockReply::Silent);
        let reply = provider
            .reply_for("tools/call", &json!({"name": "browser_click", "arguments": {}}))
            .await;
        assert!(matches!(reply, MockReply::Silent));
        let reply = provider
            .reply_for("tools/call", &json!({"name": "browser_click", "arguments": {"ref": "s1"}}))
            .await;
        assert!(matches!(reply, MockReply::Result(_)));
    }
}
