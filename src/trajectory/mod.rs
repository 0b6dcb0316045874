//! 轨迹层：动作格式化、记录器、截图产物与结果落盘

pub mod action;
pub mod artifacts;
pub mod persistence;
pub mod recorder;

pub use action::{format_action, ActionRecord, Verb};
pub use artifacts::{artifact_file_name, save_artifact};
pub use persistence::{save_session, RESULT_FILE_NAME};
pub use recorder::{ArtifactRef, SessionMetadata, SessionRecord, TrajectoryRecorder};
