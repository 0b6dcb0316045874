//! SessionRecord 落盘：`<output>/result.json`（缩进 JSON）

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::trajectory::artifacts::TRAJECTORY_DIR;
use crate::trajectory::recorder::SessionRecord;

pub const RESULT_FILE_NAME: &str = "result.json";

/// 写 result.json；同时确保 trajectory 目录存在（即使没有截图）
pub async fn save_session(output_dir: &Path, record: &SessionRecord) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir.join(TRAJECTORY_DIR))
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let path = output_dir.join(RESULT_FILE_NAME);
    let text = serde_json::to_string_pretty(record).context("serializing session record")?;
    tokio::fs::write(&path, text)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), actions = record.action_history.len(), "session saved");
    Ok(path)
}

/// 读回 result.json（用于检查与测试）
pub async fn load_session_value(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{format_action, TrajectoryRecorder};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_session_round_trip_layout() {
        let dir = TempDir::new().unwrap();
        let mut recorder = TrajectoryRecorder::new("task-9", "Find a hotel");
        recorder.record_action(format_action(
            "browser_navigate",
            json!({"url": "https://example.com"}).as_object().unwrap(),
        ));
        recorder.append_thought("Step 1: go to the site");
        let path = save_session(dir.path(), &recorder.finalize(""))
            .await
            .unwrap();

        assert!(dir.path().join("trajectory").is_dir());
        let value = load_session_value(&path).await.unwrap();
        assert_eq!(value["task_id"], "task-9");
        assert_eq!(value["action_history"][0], "<navigation> -> GOTO: https://example.com");
        assert_eq!(value["thoughts"], json!(["Step 1: go to the site"]));
        assert_eq!(value["final_result_response"], "Completed 1 actions");
        for key in ["timestamp", "total_steps", "final_url", "screenshot_count", "screenshot_failures"] {
            assert!(value["metadata"].get(key).is_some(), "missing {key}");
        }
    }
}
