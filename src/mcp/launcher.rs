//! 工具进程启动层
//!
//! Launcher 负责把一个「可以收发帧的对端」交给协议客户端：ProcessLauncher 启动真实子进程
//! （stdin / stdout 管道），测试中则可以换成内存 duplex。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::core::ClientError;
use crate::mcp::transport::Transport;

/// 启动参数中的占位符，替换为本实例的用户数据目录
pub const USER_DATA_DIR_PLACEHOLDER: &str = "{user_data_dir}";

const STDERR_TAIL_LINES: usize = 50;

/// 单次启动的上下文
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub instance_id: String,
}

/// 启动结果：传输通道 + 可选的进程句柄 + 可选的临时目录
pub struct Launched {
    pub transport: Transport,
    pub process: Option<ProviderProcess>,
    pub scratch_dir: Option<PathBuf>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, ctx: &LaunchContext) -> Result<Launched, ClientError>;
}

/// 以固定参数启动外部工具进程
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// 启动后等待多久再检查进程是否已退出
    pub startup_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            startup_grace: Duration::from_millis(2000),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn needs_scratch_dir(&self) -> bool {
        self.args.iter().any(|a| a.contains(USER_DATA_DIR_PLACEHOLDER))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, ctx: &LaunchContext) -> Result<Launched, ClientError> {
        let scratch_dir = if self.needs_scratch_dir() {
            let dir = std::env::temp_dir().join(format!("trailmark_{}", ctx.instance_id));
            std::fs::create_dir_all(&dir).map_err(|e| {
                ClientError::StartupFailure(format!(
                    "failed to create user data dir {}: {e}",
                    dir.display()
                ))
            })?;
            Some(dir)
        } else {
            None
        };

        let args: Vec<String> = match &scratch_dir {
            Some(dir) => {
                let dir = dir.to_string_lossy();
                self.args
                    .iter()
                    .map(|a| a.replace(USER_DATA_DIR_PLACEHOLDER, &dir))
                    .collect()
            }
            None => self.args.clone(),
        };

        tracing::info!(
            instance = %ctx.instance_id,
            program = %self.program,
            args = ?args,
            "spawning tool provider"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let spawned = cmd.spawn().map_err(|e| {
            ClientError::StartupFailure(format!("failed to spawn '{}': {e}", self.program))
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_scratch_dir(scratch_dir.as_ref());
                return Err(e);
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let _ = child.start_kill();
                remove_scratch_dir(scratch_dir.as_ref());
                return Err(ClientError::StartupFailure(
                    "provider stdio pipes unavailable".to_string(),
                ));
            }
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = spawn_stderr_drain(stderr, stderr_tail.clone(), ctx.instance_id.clone());

        let mut process = ProviderProcess {
            child,
            stderr_tail,
            stderr_task,
            instance_id: ctx.instance_id.clone(),
        };

        tokio::time::sleep(self.startup_grace).await;
        match process.child.try_wait() {
            Ok(Some(status)) => {
                // 等 stderr 读完再取尾部
                let _ = tokio::time::timeout(Duration::from_millis(500), &mut process.stderr_task).await;
                let stderr = process.stderr_text();
                remove_scratch_dir(scratch_dir.as_ref());
                tracing::error!(instance = %ctx.instance_id, %status, stderr = %stderr, "provider exited during startup");
                return Err(ClientError::StartupFailure(format!(
                    "provider exited immediately ({status}): {}",
                    if stderr.is_empty() { "<no stderr>" } else { stderr.as_str() }
                )));
            }
            Ok(None) => {}
            Err(e) => {
                let _ = process.child.start_kill();
                remove_scratch_dir(scratch_dir.as_ref());
                return Err(ClientError::StartupFailure(format!(
                    "failed to poll provider process: {e}"
                )));
            }
        }

        Ok(Launched {
            transport: Transport::new(Box::new(stdout), Box::new(stdin)),
            process: Some(process),
            scratch_dir,
        })
    }
}

fn spawn_stderr_drain(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    instance_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(instance = %instance_id, "provider stderr: {}", line);
            let mut buf = tail.lock().unwrap_or_else(|e| e.into_inner());
            buf.push_back(line);
            while buf.len() > STDERR_TAIL_LINES {
                buf.pop_front();
            }
        }
    })
}

pub(crate) fn remove_scratch_dir(dir: Option<&PathBuf>) {
    if let Some(dir) = dir {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), "failed to remove user data dir: {}", e);
            }
        }
    }
}

/// 进程关闭方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// 调用前已退出
    AlreadyExited,
    /// 终止信号后在宽限期内退出
    Terminated,
    /// 超过宽限期被强杀
    Killed,
}

/// 子进程句柄（stderr 在后台持续读取，保留最近若干行）
pub struct ProviderProcess {
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: JoinHandle<()>,
    instance_id: String,
}

impl ProviderProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn stderr_text(&self) -> String {
        let buf = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn try_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// 发送终止信号，宽限期内未退出则强杀
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownOutcome {
        if let Some(status) = self.try_status() {
            tracing::debug!(instance = %self.instance_id, %status, "provider already exited");
            self.stderr_task.abort();
            return ShutdownOutcome::AlreadyExited;
        }

        self.send_terminate();

        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(instance = %self.instance_id, %status, "provider terminated");
                ShutdownOutcome::Terminated
            }
            Ok(Err(e)) => {
                tracing::warn!(instance = %self.instance_id, "waiting for provider failed: {}", e);
                self.force_kill().await;
                ShutdownOutcome::Killed
            }
            Err(_) => {
                tracing::warn!(
                    instance = %self.instance_id,
                    grace_ms = grace.as_millis() as u64,
                    "provider did not exit within grace period, killing"
                );
                self.force_kill().await;
                ShutdownOutcome::Killed
            }
        };
        self.stderr_task.abort();
        outcome
    }

    async fn force_kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(instance = %self.instance_id, "kill failed: {}", e);
        }
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if result != 0 {
                tracing::warn!(
                    instance = %self.instance_id,
                    "SIGTERM failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(instance = %self.instance_id, "terminate failed: {}", e);
        }
    }
}
