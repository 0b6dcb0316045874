//! Trailmark 入口
//!
//! 用法：`trailmark <task.json|task.toml> [config.toml]`
//! 初始化日志、加载配置与任务、启动工具进程并运行主控循环，最后打印 result.json 路径。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use trailmark::config::{create_llm_from_config, load_config, AppConfig};
use trailmark::core::{ShutdownManager, StepOrchestrator};
use trailmark::decision::LlmDecisionMaker;
use trailmark::mcp::ProtocolClient;
use trailmark::task::load_task;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trailmark::observability::init();

    let mut args = std::env::args().skip(1);
    let task_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: trailmark <task file> [config file]")?;
    let config_path = args.next().map(PathBuf::from);

    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let task = load_task(&task_path)?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let llm = create_llm_from_config(&cfg);
    let decider = Arc::new(LlmDecisionMaker::new(llm).with_history_turns(cfg.llm.history_turns));
    let client = ProtocolClient::new(Arc::new(cfg.launcher()), cfg.client_config());
    let mut orchestrator = StepOrchestrator::new(client, decider.clone(), cfg.run_settings())
        .with_shutdown(shutdown);

    let outcome = orchestrator.run(&task).await;

    let (prompt, completion, total) = decider.token_usage();
    tracing::info!(prompt, completion, total, "token usage");

    match &outcome.result_path {
        Some(path) => println!("{}", path.display()),
        None => eprintln!("result was not saved (output dir {})", outcome.output_dir.display()),
    }
    if let Some(error) = &outcome.error {
        eprintln!("run ended without success: {error}");
    }
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
