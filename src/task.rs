//! 任务定义：从 TOML 或 JSON 文件加载（按扩展名判断，其他扩展名先试 JSON 再试 TOML）

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use serde::Deserialize;

use crate::decision::TaskBrief;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    /// 任务文本；也接受 confirmed_task
    #[serde(alias = "confirmed_task")]
    pub task: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    /// 覆盖配置中的步数上限
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// 覆盖配置中的步间间隔（秒）
    #[serde(default)]
    pub step_delay: Option<f64>,
}

impl TaskSpec {
    pub fn new(task_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task: task.into(),
            website: None,
            level: None,
            max_steps: None,
            step_delay: None,
        }
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn brief(&self) -> TaskBrief {
        TaskBrief {
            description: self.task.clone(),
            website: self.website.clone(),
        }
    }

    /// 本次运行的输出目录：`<root>/<task_id>_<时间戳>`
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
        root.join(format!("{}_{}", sanitize(&self.task_id), stamp))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub fn parse_task(text: &str, is_toml: bool) -> anyhow::Result<TaskSpec> {
    let spec: TaskSpec = if is_toml {
        toml::from_str(text).context("parsing TOML task")?
    } else {
        serde_json::from_str(text).context("parsing JSON task")?
    };
    if spec.task_id.trim().is_empty() {
        anyhow::bail!("task_id must not be empty");
    }
    Ok(spec)
}

pub fn load_task(path: &Path) -> anyhow::Result<TaskSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading task file {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_task(&text, true),
        Some("json") => parse_task(&text, false),
        _ => parse_task(&text, false).or_else(|_| parse_task(&text, true)),
    }
    .with_context(|| format!("loading task {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_json_with_alias() {
        let spec = parse_task(
            r#"{"task_id": "mind2web_001", "website": "https://www.wikipedia.org", "confirmed_task": "Search for Albert Einstein", "level": "easy"}"#,
            false,
        )
        .unwrap();
        assert_eq!(spec.task, "Search for Albert Einstein");
        assert_eq!(spec.level.as_deref(), Some("easy"));
        assert_eq!(spec.max_steps, None);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task.toml");
        std::fs::write(
            &path,
            "task_id = \"t1\"\ntask = \"Find a hotel\"\nwebsite = \"https://example.com\"\nmax_steps = 4\n",
        )
        .unwrap();
        let spec = load_task(&path).unwrap();
        assert_eq!(spec.task_id, "t1");
        assert_eq!(spec.max_steps, Some(4));
        assert_eq!(spec.brief().website.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_empty_task_id_rejected() {
        assert!(parse_task(r#"{"task_id": " ", "task": "x"}"#, false).is_err());
        assert!(parse_task(r#"{"task": "x"}"#, false).is_err());
    }

    #[test]
    fn test_output_dir_is_sanitized() {
        let spec = TaskSpec::new("a/b c", "x");
        let dir = spec.output_dir(Path::new("/tmp/out"));
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("a_b_c_"));
    }
}
