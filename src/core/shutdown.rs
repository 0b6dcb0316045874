//! 关闭信号处理
//!
//! Ctrl+C / SIGTERM 记下原因并触发取消 token；编排器在当前步结束后进入 Terminating，
//! 照常关闭工具进程，并把原因写进 result.json 的 final_result_response。

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 取消原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserInitiated => write!(f, "interrupted by Ctrl+C"),
            ShutdownReason::Signal => write!(f, "terminated by SIGTERM"),
        }
    }
}

/// 一次运行的取消句柄；克隆共享同一 token 与原因
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 取消说明，写入运行结果
    pub fn cancel_note(&self) -> String {
        match self.reason() {
            Some(reason) => format!("Run cancelled: {reason}"),
            None => "Run cancelled".to_string(),
        }
    }

    /// 监听 Ctrl+C 与 SIGTERM（unix）
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, stopping after the current step");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if sigterm.recv().await.is_some() {
                            tracing::info!("received SIGTERM, stopping after the current step");
                            manager.shutdown(ShutdownReason::Signal);
                        }
                    });
                }
                Err(e) => tracing::warn!("cannot install SIGTERM handler: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.cancel_note(), "Run cancelled");

        manager.shutdown(ShutdownReason::Signal);
        manager.clone().shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
        assert_eq!(manager.cancel_note(), "Run cancelled: terminated by SIGTERM");
    }
}
