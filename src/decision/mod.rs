//! 决策层：决策请求 / 决定、回复解析、prompt 构建与基于 LLM 的决策方

pub mod llm_decider;
pub mod parser;
pub mod prompt;
pub mod types;

pub use llm_decider::LlmDecisionMaker;
pub use parser::{parse_decision, DecisionFormat};
pub use prompt::{step_prompt, system_prompt, truncate_snapshot, TRUNCATION_MARKER};
pub use types::{Decision, DecisionMaker, DecisionRequest, TaskBrief};
