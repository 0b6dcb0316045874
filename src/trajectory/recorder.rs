//! 轨迹记录器：只追加的动作、产物、位置与思考记录，finalize 时产出 SessionRecord 快照

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

use crate::trajectory::action::ActionRecord;

/// 一个已保存的产物（截图）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub step: usize,
    pub path: PathBuf,
}

impl Serialize for ArtifactRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.path.display())
    }
}

/// 运行元数据
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub timestamp: String,
    pub total_steps: usize,
    pub final_url: String,
    pub screenshot_count: usize,
    pub screenshot_failures: usize,
}

/// 一次运行的完整记录（持久化为 result.json）
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub task_id: String,
    pub task: String,
    pub final_result_response: String,
    pub action_history: Vec<ActionRecord>,
    pub thoughts: Vec<String>,
    pub screenshots: Vec<ArtifactRef>,
    pub metadata: SessionMetadata,
}

#[derive(Debug)]
pub struct TrajectoryRecorder {
    task_id: String,
    task: String,
    actions: Vec<ActionRecord>,
    artifacts: Vec<ArtifactRef>,
    thoughts: Vec<String>,
    location: String,
    steps: usize,
    artifact_failures: usize,
    started_at: DateTime<Local>,
}

impl TrajectoryRecorder {
    pub fn new(task_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task: task.into(),
            actions: Vec::new(),
            artifacts: Vec::new(),
            thoughts: Vec::new(),
            location: String::new(),
            steps: 0,
            artifact_failures: 0,
            started_at: Local::now(),
        }
    }

    pub fn record_action(&mut self, action: ActionRecord) {
        tracing::info!(task_id = %self.task_id, "action recorded: {}", action);
        self.actions.push(action);
    }

    pub fn record_artifact(&mut self, step: usize, path: impl AsRef<Path>) {
        self.artifacts.push(ArtifactRef {
            step,
            path: path.as_ref().to_path_buf(),
        });
    }

    pub fn note_artifact_failure(&mut self) {
        self.artifact_failures += 1;
    }

    pub fn set_current_location(&mut self, location: impl Into<String>) {
        self.location = location.into();
    }

    pub fn append_thought(&mut self, thought: impl Into<String>) {
        self.thoughts.push(thought.into());
    }

    /// 记录已执行的步数（包括失败的步骤）
    pub fn set_steps(&mut self, steps: usize) {
        self.steps = steps;
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn artifacts(&self) -> &[ArtifactRef] {
        &self.artifacts
    }

    pub fn thoughts(&self) -> &[String] {
        &self.thoughts
    }

    pub fn latest_artifact(&self) -> Option<&ArtifactRef> {
        self.artifacts.last()
    }

    pub fn current_location(&self) -> &str {
        &self.location
    }

    pub fn artifact_failures(&self) -> usize {
        self.artifact_failures
    }

    /// 产出当前状态的快照；summary 为空时使用 "Completed N actions"
    pub fn finalize(&self, summary: &str) -> SessionRecord {
        let final_result_response = if summary.trim().is_empty() {
            format!("Completed {} actions", self.actions.len())
        } else {
            summary.to_string()
        };
        if self.artifact_failures > 0 {
            tracing::warn!(
                captured = self.artifacts.len(),
                failed = self.artifact_failures,
                "screenshot summary"
            );
        }
        SessionRecord {
            task_id: self.task_id.clone(),
            task: self.task.clone(),
            final_result_response,
            action_history: self.actions.clone(),
            thoughts: self.thoughts.clone(),
            screenshots: self.artifacts.clone(),
            metadata: SessionMetadata {
                timestamp: self.started_at.to_rfc3339(),
                total_steps: self.steps,
                final_url: self.location.clone(),
                screenshot_count: self.artifacts.len(),
                screenshot_failures: self.artifact_failures,
            },
        }
    }
}
