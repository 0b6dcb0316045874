//! Trailmark - 基于外部工具进程的网页任务执行与轨迹记录
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行阶段状态机、步间节奏、关闭信号、主控循环
//! - **decision**: 决策请求与回复解析、prompt 构建、基于 LLM 的决策方
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: 工具进程协议客户端（子进程 + 行分隔 JSON-RPC）
//! - **task**: 任务文件加载
//! - **tools**: 工具描述、参数校验与注册表
//! - **trajectory**: 动作格式化、轨迹记录、截图与结果落盘

pub mod config;
pub mod core;
pub mod decision;
pub mod llm;
pub mod mcp;
pub mod observability;
pub mod task;
pub mod tools;
pub mod trajectory;
