//! 核心编排层：错误分类、运行阶段、步间节奏、关闭信号与主控循环

pub mod error;
pub mod orchestrator;
pub mod pacing;
pub mod shutdown;
pub mod state;

pub use error::{ClientError, DecisionError, RunError};
pub use orchestrator::{RunOutcome, RunSettings, StepOrchestrator};
pub use pacing::StepPacer;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::RunPhase;
