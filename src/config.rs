//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRAILMARK__*` 覆盖（双下划线表示嵌套，如 `TRAILMARK__RUN__MAX_STEPS=20`）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RunSettings;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::mcp::{ClientConfig, ProcessLauncher};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderSection,
    pub run: RunSection,
    pub llm: LlmSection,
}

/// [provider] 段：工具进程命令行与各项超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub program: String,
    /// 参数中的 `{user_data_dir}` 会被替换为本实例的临时目录
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub startup_grace_ms: u64,
    pub handshake_timeout_secs: u64,
    pub invoke_timeout_secs: u64,
    pub stop_grace_ms: u64,
    pub protocol_version: String,
    /// initialize 中上报的客户端名
    pub client_name: String,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: [
                "-y",
                "@playwright/mcp",
                "--browser",
                "chromium",
                "--headless",
                "--no-sandbox",
                "--user-data-dir",
                "{user_data_dir}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            env: BTreeMap::new(),
            startup_grace_ms: 2000,
            handshake_timeout_secs: 5,
            invoke_timeout_secs: 60,
            stop_grace_ms: 5000,
            protocol_version: "2024-11-05".to_string(),
            client_name: "trailmark".to_string(),
        }
    }
}

/// [run] 段：步数、节奏、工具名与输出目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub max_steps: usize,
    /// 步间基础间隔（秒）
    pub step_delay_secs: f64,
    pub snapshot_tool: String,
    pub screenshot_tool: String,
    pub navigate_tool: String,
    /// 为空表示不调用
    pub setup_tool: String,
    pub max_snapshot_chars: usize,
    pub max_consecutive_parse_errors: usize,
    pub decision_timeout_secs: u64,
    pub initial_artifact_attempts: usize,
    pub output_root: PathBuf,
}

impl Default for RunSection {
    fn default() -> Self {
        let settings = RunSettings::default();
        Self {
            max_steps: settings.max_steps,
            step_delay_secs: settings.step_delay.as_secs_f64(),
            snapshot_tool: settings.snapshot_tool,
            screenshot_tool: settings.screenshot_tool,
            navigate_tool: settings.navigate_tool,
            setup_tool: settings.setup_tool.unwrap_or_default(),
            max_snapshot_chars: settings.max_snapshot_chars,
            max_consecutive_parse_errors: settings.max_consecutive_parse_errors,
            decision_timeout_secs: settings.decision_timeout.as_secs(),
            initial_artifact_attempts: settings.initial_artifact_attempts,
            output_root: settings.output_root,
        }
    }
}

/// [llm] 段：决策方后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 决策对话保留的最近轮数
    pub history_turns: usize,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            history_turns: 4,
        }
    }
}

impl AppConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_name: self.provider.client_name.clone(),
            protocol_version: self.provider.protocol_version.clone(),
            handshake_timeout: Duration::from_secs(self.provider.handshake_timeout_secs),
            invoke_timeout: Duration::from_secs(self.provider.invoke_timeout_secs),
            stop_grace: Duration::from_millis(self.provider.stop_grace_ms),
            ..ClientConfig::default()
        }
    }

    pub fn launcher(&self) -> ProcessLauncher {
        self.provider.env.iter().fold(
            ProcessLauncher::new(self.provider.program.clone(), self.provider.args.clone())
                .with_startup_grace(Duration::from_millis(self.provider.startup_grace_ms)),
            |launcher, (k, v)| launcher.with_env(k, v),
        )
    }

    pub fn run_settings(&self) -> RunSettings {
        let run = &self.run;
        let step_delay = Duration::try_from_secs_f64(run.step_delay_secs).unwrap_or(Duration::ZERO);
        RunSettings {
            max_steps: run.max_steps,
            step_delay,
            snapshot_tool: run.snapshot_tool.clone(),
            screenshot_tool: run.screenshot_tool.clone(),
            navigate_tool: run.navigate_tool.clone(),
            setup_tool: Some(run.setup_tool.clone()).filter(|t| !t.trim().is_empty()),
            max_snapshot_chars: run.max_snapshot_chars,
            max_consecutive_parse_errors: run.max_consecutive_parse_errors.max(1),
            decision_timeout: Duration::from_secs(run.decision_timeout_secs),
            initial_artifact_attempts: run.initial_artifact_attempts.max(1),
            output_root: run.output_root.clone(),
            ..RunSettings::default()
        }
    }
}

/// 从 config 目录加载配置，环境变量 TRAILMARK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRAILMARK__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRAILMARK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 根据配置与环境变量选择决策方后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "openai" && api_key.is_some() {
        tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            api_key.as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider is '{}', using Mock LLM", provider);
        Arc::new(MockLlmClient::new())
    }
}
