//! 错误类型
//!
//! ClientError 对应工具进程协议客户端的失败分类：StartupFailure / HandshakeFailure 为致命错误，
//! 其余（校验、超时、协议读取）只影响单次调用；DecisionError 对应决策方边界；RunError 汇总终止一次运行的原因。

use thiserror::Error;

/// 协议客户端错误（启动、握手、校验、超时、协议读取）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Provider startup failed: {0}")]
    StartupFailure(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Client not initialized, call start() first")]
    ClientNotInitialized,

    #[error("Validation failed for '{tool}': {reason}")]
    ValidationFailed { tool: String, reason: String },

    #[error("Timed out after {timeout_ms}ms waiting for '{method}' (id {id})")]
    Timeout {
        method: String,
        id: u64,
        timeout_ms: u64,
    },

    /// 畸形帧、空读 / 流关闭、未匹配 id、显式 error 响应统一归入此类
    #[error("Protocol read failure: {0}")]
    ProtocolReadFailure(String),
}

impl ClientError {
    /// 致命错误使当前客户端实例失效，需重新 start()
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::StartupFailure(_) | ClientError::HandshakeFailure(_)
        )
    }

    /// 简短分类名（用于日志与审计）
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::StartupFailure(_) => "startup_failure",
            ClientError::HandshakeFailure(_) => "handshake_failure",
            ClientError::ClientNotInitialized => "client_not_initialized",
            ClientError::ValidationFailed { .. } => "validation_failed",
            ClientError::Timeout { .. } => "timeout",
            ClientError::ProtocolReadFailure(_) => "protocol_read_failure",
        }
    }
}

/// 决策方（外部推理服务）调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecisionError {
    /// 限流（429 / resource exhausted），由编排器退避后继续
    #[error("Decision maker rate limited: {0}")]
    RateLimited(String),

    #[error("Decision maker timed out after {0}s")]
    Timeout(u64),

    #[error("Decision maker unavailable: {0}")]
    Transport(String),
}

impl DecisionError {
    /// 根据错误文本归类：限流关键字 -> RateLimited，超时关键字 -> Timeout(0)，其余 -> Transport
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429")
            || lower.contains("resource_exhausted")
            || lower.contains("too many requests")
            || lower.contains("rate limit")
        {
            DecisionError::RateLimited(message)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            DecisionError::Timeout(0)
        } else {
            DecisionError::Transport(message)
        }
    }
}

/// 终止一次运行（进入 Failed）的原因
#[derive(Error, Debug, Clone)]
pub enum RunError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Decision(#[from] DecisionError),

    #[error("Initial artifact capture failed: {0}")]
    InitialArtifact(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(ClientError::StartupFailure("x".into()).is_fatal());
        assert!(ClientError::HandshakeFailure("x".into()).is_fatal());
        assert!(!ClientError::ClientNotInitialized.is_fatal());
        assert!(!ClientError::ProtocolReadFailure("x".into()).is_fatal());
        let timeout = ClientError::Timeout {
            method: "tools/call".into(),
            id: 3,
            timeout_ms: 100,
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.kind(), "timeout");
    }

    #[test]
    fn test_validation_message_names_tool() {
        let err = ClientError::ValidationFailed {
            tool: "browser_click".into(),
            reason: "Missing required field: 'ref'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("browser_click"));
        assert!(text.contains("'ref'"));
    }

    #[test]
    fn test_classify_decision_errors() {
        assert!(matches!(
            DecisionError::classify("HTTP 429 Too Many Requests"),
            DecisionError::RateLimited(_)
        ));
        assert!(matches!(
            DecisionError::classify("RESOURCE_EXHAUSTED: quota"),
            DecisionError::RateLimited(_)
        ));
        assert!(matches!(
            DecisionError::classify("request timed out"),
            DecisionError::Timeout(_)
        ));
        assert!(matches!(
            DecisionError::classify("connection refused"),
            DecisionError::Transport(_)
        ));
    }
}
