//! 决策边界：每步向决策方提交的请求与它给出的决定

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::DecisionError;
use crate::tools::ToolDescriptor;

/// 任务说明（仅第一步提交）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBrief {
    pub description: String,
    pub website: Option<String>,
}

/// 单步决策请求
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    /// 从 1 开始
    pub step: usize,
    pub task: Option<TaskBrief>,
    /// 当前页面快照（已截断）
    pub snapshot: String,
    /// 完整能力列表
    pub tools: Vec<ToolDescriptor>,
    /// 上一步失败的说明（调用失败或回复无法解析）
    pub feedback: Option<String>,
    /// 最近一张截图，随本步消息一并提交
    pub screenshot: Option<PathBuf>,
}

/// 决策方给出的下一步
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// 调用一个工具
    Act {
        thought: String,
        tool: String,
        args: Map<String, Value>,
    },
    /// 任务结束（finish / stop）
    Finish { thought: String },
    /// 回复无法解析，不派发
    Invalid { reason: String, raw: String },
}

#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, DecisionError>;
}
