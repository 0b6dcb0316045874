//! 工具进程协议客户端
//!
//! 一个 ProtocolClient 实例独占一个外部进程：start() 启动并握手（initialize -> notifications/initialized），
//! 随后拉取 tools/list 建立缓存；invoke() 先本地校验参数，再发送 tools/call 并在超时内等待按 id 关联的响应。
//!
//! 并发模型：
//! - stdout 由后台读取任务逐行读取，按 id 投递到 PendingTable 中的 oneshot；
//! - 写请求 + 等待响应在 session 互斥锁内完成，同一时刻最多一个在途请求；
//! - 超时是唯一的取消方式，超时 id 被记住，迟到响应丢弃。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at};

use crate::core::ClientError;
use crate::mcp::content::text_content;
use crate::mcp::launcher::{remove_scratch_dir, LaunchContext, Launched, Launcher, ProviderProcess};
use crate::mcp::message::{self, decode_frame, Frame, INITIALIZED_NOTIFICATION, TOOLS_LIST_CHANGED};
use crate::mcp::pending::{Delivery, PendingTable};
use crate::mcp::transport::{FrameReader, FrameWriter};
use crate::tools::{ToolDescriptor, ToolRegistry};

/// tools/list 翻页上限
const MAX_LIST_PAGES: usize = 32;

/// 客户端参数
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
    /// 握手与 tools/list 的等待上限
    pub handshake_timeout: Duration,
    /// tools/call 的等待上限
    pub invoke_timeout: Duration,
    /// stop() 发送终止信号后的宽限期
    pub stop_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "trailmark".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: "2024-11-05".to_string(),
            handshake_timeout: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// 单次 invoke 的结果（调用后由编排器立即消费）
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub outcome: Result<Value, ClientError>,
    pub duration_ms: u64,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ClientError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value, ClientError> {
        self.outcome
    }
}

/// 一次 start() 到 stop() 之间持有的资源
struct Session {
    writer: FrameWriter,
    pending: Arc<PendingTable>,
    reader_task: JoinHandle<()>,
    process: Option<ProviderProcess>,
    scratch_dir: Option<PathBuf>,
}

pub struct ProtocolClient {
    config: ClientConfig,
    instance_id: String,
    launcher: Arc<dyn Launcher>,
    next_id: AtomicU64,
    session: Mutex<Option<Session>>,
    registry: RwLock<Option<ToolRegistry>>,
    server_info: RwLock<Option<Value>>,
    initialized: AtomicBool,
    cache_stale: Arc<AtomicBool>,
}

impl ProtocolClient {
    pub fn new(launcher: Arc<dyn Launcher>, config: ClientConfig) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            config,
            instance_id: format!("provider_{}", &suffix[..8]),
            launcher,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
            registry: RwLock::new(None),
            server_info: RwLock::new(None),
            initialized: AtomicBool::new(false),
            cache_stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 握手阶段工具进程返回的 initialize 结果（serverInfo / capabilities 等）
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 已握手且工具缓存已建立
    pub fn is_ready(&self) -> bool {
        self.is_initialized()
            && self
                .registry
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
    }

    /// 启动工具进程、握手并拉取工具列表；已在运行时仅告警
    pub async fn start(&self) -> Result<(), ClientError> {
        {
            let mut guard = self.session.lock().await;
            if guard.is_some() {
                tracing::warn!(instance = %self.instance_id, "start() called while provider is running, ignoring");
                return Ok(());
            }

            self.initialized.store(false, Ordering::SeqCst);
            let ctx = LaunchContext {
                instance_id: self.instance_id.clone(),
            };
            let Launched {
                transport,
                process,
                scratch_dir,
            } = self.launcher.launch(&ctx).await?;

            let pending = Arc::new(PendingTable::new());
            let reader_task = tokio::spawn(read_loop(
                transport.reader,
                pending.clone(),
                self.cache_stale.clone(),
                self.instance_id.clone(),
            ));
            let mut session = Session {
                writer: transport.writer,
                pending,
                reader_task,
                process,
                scratch_dir,
            };

            match self.handshake(&mut session).await {
                Ok(info) => {
                    let server = info.get("serverInfo").cloned().unwrap_or_default();
                    tracing::info!(instance = %self.instance_id, server = %server, "handshake complete");
                    *self.server_info.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
                }
                Err(e) => {
                    tracing::error!(instance = %self.instance_id, "handshake failed: {}", e);
                    self.teardown(session).await;
                    return Err(match e {
                        ClientError::HandshakeFailure(_) => e,
                        other => ClientError::HandshakeFailure(other.to_string()),
                    });
                }
            }

            *guard = Some(session);
            self.initialized.store(true, Ordering::SeqCst);
        }

        if let Err(e) = self.list_capabilities(true).await {
            tracing::error!(instance = %self.instance_id, "initial tool discovery failed: {}", e);
            self.stop().await;
            return Err(ClientError::HandshakeFailure(format!(
                "tool discovery failed: {e}"
            )));
        }
        Ok(())
    }

    async fn handshake(&self, session: &mut Session) -> Result<Value, ClientError> {
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
        });
        let result = self
            .request(session, "initialize", params, self.config.handshake_timeout)
            .await?;
        if !result.is_object() {
            return Err(ClientError::HandshakeFailure(format!(
                "initialize returned a non-object result: {result}"
            )));
        }
        if let Some(version) = result.get("protocolVersion").and_then(|v| v.as_str()) {
            if version != self.config.protocol_version {
                tracing::warn!(
                    instance = %self.instance_id,
                    requested = %self.config.protocol_version,
                    server = version,
                    "provider negotiated a different protocol version"
                );
            }
        }

        let note = message::notification(INITIALIZED_NOTIFICATION);
        match timeout(self.config.handshake_timeout, session.writer.send(&note)).await {
            Ok(Ok(())) => Ok(result),
            Ok(Err(e)) => Err(ClientError::HandshakeFailure(format!(
                "failed to send initialized notification: {e}"
            ))),
            Err(_) => Err(ClientError::HandshakeFailure(
                "timed out sending initialized notification".to_string(),
            )),
        }
    }

    /// 写一帧请求并在预算内等待对应 id 的响应
    async fn request(
        &self,
        session: &mut Session,
        method: &str,
        params: Value,
        budget: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (rx, deadline) = session.pending.register(id, method, budget)?;
        let timed_out = || ClientError::Timeout {
            method: method.to_string(),
            id,
            timeout_ms: budget.as_millis() as u64,
        };

        let frame = message::request(id, method, params);
        tracing::debug!(instance = %self.instance_id, id, method, "-> request");
        match timeout_at(deadline, session.writer.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.pending.remove(id);
                return Err(ClientError::ProtocolReadFailure(format!(
                    "failed to write '{method}' request: {e}"
                )));
            }
            Err(_) => {
                session.pending.expire(id);
                return Err(timed_out());
            }
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => {
                tracing::debug!(instance = %self.instance_id, id, method, ok = reply.is_ok(), "<- response");
                reply
            }
            Ok(Err(_)) => Err(ClientError::ProtocolReadFailure(format!(
                "response channel for '{method}' (id {id}) closed"
            ))),
            Err(_) => {
                session.pending.expire(id);
                tracing::warn!(
                    instance = %self.instance_id,
                    id,
                    method,
                    timeout_ms = budget.as_millis() as u64,
                    "request timed out"
                );
                Err(timed_out())
            }
        }
    }

    /// 工具列表；缓存已建立且未强制刷新时直接返回缓存
    pub async fn list_capabilities(
        &self,
        force_refresh: bool,
    ) -> Result<Vec<ToolDescriptor>, ClientError> {
        if !self.is_initialized() {
            return Err(ClientError::ClientNotInitialized);
        }
        let stale = self.cache_stale.load(Ordering::SeqCst);
        if !force_refresh && !stale {
            let cached = self.registry.read().unwrap_or_else(|e| e.into_inner());
            if let Some(registry) = cached.as_ref().filter(|r| !r.is_empty()) {
                return Ok(registry.tools().to_vec());
            }
        }
        if stale {
            tracing::info!(instance = %self.instance_id, "tool list changed, refetching");
        }

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::ClientNotInitialized)?;
        self.cache_stale.store(false, Ordering::SeqCst);

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for page in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self
                .request(session, "tools/list", params, self.config.handshake_timeout)
                .await?;
            match result.get("tools").and_then(|t| t.as_array()) {
                Some(entries) => {
                    for entry in entries {
                        match serde_json::from_value::<ToolDescriptor>(entry.clone()) {
                            Ok(tool) => tools.push(tool),
                            Err(e) => tracing::warn!(
                                instance = %self.instance_id,
                                "skipping malformed tool entry: {}",
                                e
                            ),
                        }
                    }
                }
                None => tracing::warn!(instance = %self.instance_id, page, "tools/list result has no 'tools' array"),
            }
            cursor = result
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }
        if cursor.is_some() {
            tracing::warn!(instance = %self.instance_id, "tools/list pagination exceeded {} pages, truncating", MAX_LIST_PAGES);
        }
        drop(guard);

        let registry = ToolRegistry::from_tools(tools);
        tracing::info!(
            instance = %self.instance_id,
            count = registry.len(),
            tools = ?registry.tool_names(),
            "tool registry loaded"
        );
        let list = registry.tools().to_vec();
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = Some(registry);
        Ok(list)
    }

    /// 按名称查缓存；未知或缓存未建立时返回 None
    pub fn get_schema(&self, name: &str) -> Option<ToolDescriptor> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|r| r.get(name).cloned())
    }

    /// 当前缓存的快照
    pub fn registry(&self) -> Option<ToolRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 校验并调用工具；每次调用输出一条 JSON 审计日志
    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> InvocationResult {
        let start = Instant::now();
        let outcome = self.invoke_inner(name, &arguments).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, kind) = match &outcome {
            Ok(_) => (true, "ok"),
            Err(e) => (false, e.kind()),
        };
        let audit = json!({
            "event": "tool_audit",
            "instance": self.instance_id,
            "tool": name,
            "ok": ok,
            "outcome": kind,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        InvocationResult {
            tool_name: name.to_string(),
            arguments,
            outcome,
            duration_ms,
        }
    }

    async fn invoke_inner(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        if !self.is_initialized() {
            return Err(ClientError::ClientNotInitialized);
        }
        let descriptor = self
            .get_schema(name)
            .ok_or_else(|| ClientError::ValidationFailed {
                tool: name.to_string(),
                reason: format!("Tool '{name}' not found in cache"),
            })?;
        descriptor
            .validate_arguments(arguments)
            .map_err(|reason| ClientError::ValidationFailed {
                tool: name.to_string(),
                reason,
            })?;

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::ClientNotInitialized)?;
        let params = json!({
            "name": name,
            "arguments": Value::Object(arguments.clone()),
        });
        let result = self
            .request(session, "tools/call", params, self.config.invoke_timeout)
            .await?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            let detail = text_content(&result);
            return Err(ClientError::ProtocolReadFailure(format!(
                "tool '{name}' reported an error: {}",
                if detail.is_empty() { "<no detail>" } else { detail.as_str() }
            )));
        }
        Ok(result)
    }

    /// 关闭工具进程；可重复调用，未启动时只记录一条日志
    pub async fn stop(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                tracing::info!(instance = %self.instance_id, "stopping provider");
                self.teardown(session).await;
            }
            None => {
                tracing::info!(instance = %self.instance_id, "stop(): provider not running, nothing to do");
            }
        }
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.server_info.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.cache_stale.store(false, Ordering::SeqCst);
    }

    async fn teardown(&self, session: Session) {
        let Session {
            writer,
            pending,
            reader_task,
            process,
            scratch_dir,
        } = session;
        pending.close("client stopped");
        // 关闭 stdin，让工具进程自然退出
        drop(writer);
        if let Some(mut process) = process {
            let outcome = process.shutdown(self.config.stop_grace).await;
            tracing::debug!(instance = %self.instance_id, ?outcome, "provider process shut down");
        }
        reader_task.abort();
        remove_scratch_dir(scratch_dir.as_ref());
    }
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 后台读取：逐行解码并投递；流结束时关闭待响应表
async fn read_loop(
    mut reader: FrameReader,
    pending: Arc<PendingTable>,
    cache_stale: Arc<AtomicBool>,
    instance_id: String,
) {
    loop {
        let line = match reader.next_line().await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(e))) => {
                tracing::warn!(instance = %instance_id, "malformed frame: {}", e);
                pending.fail_in_flight("malformed frame: invalid UTF-8");
                continue;
            }
            Ok(None) => {
                tracing::debug!(instance = %instance_id, "provider closed stdout");
                pending.close("provider closed its output stream");
                return;
            }
            Err(e) => {
                tracing::warn!(instance = %instance_id, "reading provider output failed: {}", e);
                pending.close(&format!("failed to read provider output: {e}"));
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_frame(&line) {
            Ok(Frame::Response { id, outcome }) => {
                let reply = outcome.map_err(|e| {
                    ClientError::ProtocolReadFailure(format!("server returned error: {}", e.message))
                });
                match pending.deliver(id, reply) {
                    Delivery::Delivered => {}
                    Delivery::Stale => {
                        tracing::warn!(instance = %instance_id, id, "discarding late response for timed-out request");
                    }
                    Delivery::Unmatched => {
                        tracing::warn!(instance = %instance_id, id, "response with unknown id");
                        pending.fail_in_flight(&format!("response with unknown id {id}"));
                    }
                }
            }
            Ok(Frame::Notification { method, .. }) => {
                if method == TOOLS_LIST_CHANGED {
                    cache_stale.store(true, Ordering::SeqCst);
                }
                tracing::debug!(instance = %instance_id, method = %method, "provider notification");
            }
            Ok(Frame::ServerRequest { id, method }) => {
                tracing::warn!(instance = %instance_id, %id, method = %method, "ignoring request from provider");
            }
            Err(reason) => {
                let preview: String = line.chars().take(200).collect();
                tracing::warn!(instance = %instance_id, frame = %preview, "malformed frame: {}", reason);
                pending.fail_in_flight(&format!("malformed frame: {reason}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_format() {
        let launcher = Arc::new(crate::mcp::mock::MockLauncher::new(
            crate::mcp::mock::MockProvider::browser(),
        ));
        let client = ProtocolClient::new(launcher, ClientConfig::default());
        let id = client.instance_id();
        assert!(id.starts_with("provider_"));
        assert_eq!(id.len(), "provider_".len() + 8);
    }

    #[test]
    fn test_args_preview_truncates() {
        let mut args = Map::new();
        args.insert("text".into(), Value::String("x".repeat(500)));
        let preview = args_preview(&args);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }

    #[tokio::test]
    async fn test_get_schema_before_start_is_none() {
        let launcher = Arc::new(crate::mcp::mock::MockLauncher::new(
            crate::mcp::mock::MockProvider::browser(),
        ));
        let client = ProtocolClient::new(launcher, ClientConfig::default());
        assert!(client.get_schema("browser_click").is_none());
        assert!(!client.is_ready());
        assert_eq!(
            client.list_capabilities(false).await.unwrap_err(),
            ClientError::ClientNotInitialized
        );
    }
}
