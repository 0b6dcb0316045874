//! 步骤编排器：主控循环
//!
//! Idle -> Starting（启动客户端、拉取工具、初始导航、初始截图）-> Running(n)（快照 -> 决策 -> 校验并派发 -> 记录 -> 截图）
//! -> Terminating（finish / stop / 关闭浏览器 / 步数上限 / 解析失败过多 / 取消）-> Closed；
//! 启动失败或决策方超时 / 不可用时进入 Failed。无论哪条路径都会调用 stop() 并产出 SessionRecord。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use crate::core::{ClientError, DecisionError, RunError, RunPhase, ShutdownManager, StepPacer};
use crate::decision::{truncate_snapshot, Decision, DecisionMaker, DecisionRequest};
use crate::mcp::{text_content, ProtocolClient};
use crate::task::TaskSpec;
use crate::tools::ToolDescriptor;
use crate::trajectory::{format_action, save_artifact, save_session, SessionRecord, TrajectoryRecorder, Verb};

/// 不转发给工具进程的关闭类工具名
const CLOSE_TOOLS: [&str; 4] = ["browser_close", "close", "browser_quit", "quit"];

/// 编排参数（由配置 [run] 段构建）
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_steps: usize,
    pub step_delay: Duration,
    pub snapshot_tool: String,
    pub screenshot_tool: String,
    pub navigate_tool: String,
    /// 初始导航前调用的准备工具（如 browser_install）；工具进程未提供时跳过
    pub setup_tool: Option<String>,
    pub max_snapshot_chars: usize,
    pub max_consecutive_parse_errors: usize,
    pub decision_timeout: Duration,
    pub initial_artifact_attempts: usize,
    pub artifact_retry_delay: Duration,
    pub output_root: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_steps: 10,
            step_delay: Duration::from_secs(2),
            snapshot_tool: "browser_snapshot".to_string(),
            screenshot_tool: "browser_take_screenshot".to_string(),
            navigate_tool: "browser_navigate".to_string(),
            setup_tool: Some("browser_install".to_string()),
            max_snapshot_chars: 20_000,
            max_consecutive_parse_errors: 3,
            decision_timeout: Duration::from_secs(300),
            initial_artifact_attempts: 3,
            artifact_retry_delay: Duration::from_secs(1),
            output_root: PathBuf::from(".output/results"),
        }
    }
}

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub phase: RunPhase,
    pub success: bool,
    pub steps: usize,
    pub error: Option<String>,
    pub record: SessionRecord,
    pub output_dir: PathBuf,
    pub result_path: Option<PathBuf>,
}

/// 循环正常结束（进入 Terminating）的方式
#[derive(Debug)]
struct LoopEnd {
    success: bool,
    note: String,
}

pub struct StepOrchestrator {
    client: ProtocolClient,
    decider: Arc<dyn DecisionMaker>,
    settings: RunSettings,
    phase: RunPhase,
    steps: usize,
    shutdown: ShutdownManager,
}

fn is_close_tool(name: &str) -> bool {
    let lower = name.to_lowercase();
    CLOSE_TOOLS.contains(&lower.as_str())
}

fn args_of(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn action_failure_feedback(tool: &str, args: &Map<String, Value>, error: &ClientError) -> String {
    format!(
        "Your previous action failed with error:\n{error}\n\nTool: {tool}\nParameters you provided: {}\n\n\
Please check the AVAILABLE TOOLS section for the correct required parameters.\n\
Most interactive tools require BOTH:\n  - \"element\": Human-readable description (e.g., \"Search textbox\")\n  - \"ref\": Snapshot reference (e.g., \"s8\")\n\n\
Try again with the correct parameters.",
        Value::Object(args.clone())
    )
}

impl StepOrchestrator {
    pub fn new(client: ProtocolClient, decider: Arc<dyn DecisionMaker>, settings: RunSettings) -> Self {
        Self {
            client,
            decider,
            settings,
            phase: RunPhase::Idle,
            steps: 0,
            shutdown: ShutdownManager::new(),
        }
    }

    /// 外部取消（Ctrl+C / SIGTERM）：当前步结束后进入 Terminating
    pub fn with_shutdown(mut self, shutdown: ShutdownManager) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    fn transition(&mut self, next: RunPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(from = ?self.phase, to = ?next, "unexpected phase transition");
        }
        tracing::debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    /// 执行一个任务直到终态；总会调用 stop() 并写出 result.json
    pub async fn run(&mut self, task: &TaskSpec) -> RunOutcome {
        let output_dir = task.output_dir(&self.settings.output_root);
        let mut recorder = TrajectoryRecorder::new(task.task_id.clone(), task.task.clone());
        self.phase = RunPhase::Idle;
        self.steps = 0;
        tracing::info!(task_id = %task.task_id, output = %output_dir.display(), "starting task");

        self.transition(RunPhase::Starting);
        let (success, error, summary) = match self.start_session(task, &output_dir, &mut recorder).await {
            Err(e) => {
                tracing::error!(task_id = %task.task_id, "start failed: {}", e);
                self.transition(RunPhase::Failed);
                (false, Some(e.to_string()), format!("Run failed during start: {e}"))
            }
            Ok(()) => {
                self.transition(RunPhase::Running(1));
                match self.step_loop(task, &output_dir, &mut recorder).await {
                    Ok(end) => {
                        self.transition(RunPhase::Terminating);
                        let error = (!end.success).then(|| end.note.clone());
                        (end.success, error, end.note)
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task.task_id, step = self.steps, "run failed: {}", e);
                        self.transition(RunPhase::Failed);
                        (false, Some(e.to_string()), format!("Run failed: {e}"))
                    }
                }
            }
        };

        self.client.stop().await;
        if self.phase == RunPhase::Terminating {
            self.transition(RunPhase::Closed);
        }

        recorder.set_steps(self.steps);
        let record = recorder.finalize(&summary);
        let result_path = match save_session(&output_dir, &record).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("failed to save session: {:#}", e);
                None
            }
        };
        tracing::info!(
            task_id = %task.task_id,
            phase = ?self.phase,
            success,
            steps = self.steps,
            actions = record.action_history.len(),
            "task finished"
        );

        RunOutcome {
            phase: self.phase,
            success,
            steps: self.steps,
            error,
            record,
            output_dir,
            result_path,
        }
    }

    async fn start_session(
        &mut self,
        task: &TaskSpec,
        output_dir: &std::path::Path,
        recorder: &mut TrajectoryRecorder,
    ) -> Result<(), RunError> {
        self.client.start().await?;
        let tools = self.client.list_capabilities(false).await?;
        tracing::info!(count = tools.len(), "retrieved tools from provider");

        if let Some(setup) = self.settings.setup_tool.as_deref().filter(|t| !t.is_empty()) {
            if self.client.get_schema(setup).is_some() {
                tracing::info!(tool = setup, "running setup tool");
                if let Err(e) = self.client.invoke(setup, Map::new()).await.into_result() {
                    tracing::warn!(tool = setup, kind = e.kind(), "setup tool failed, continuing: {}", e);
                }
            }
        }

        if let Some(website) = task.website.as_deref().filter(|w| !w.trim().is_empty()) {
            if self.client.get_schema(&self.settings.navigate_tool).is_some() {
                tracing::info!(url = website, "navigating to start page");
                let args = args_of(json!({ "url": website }));
                self.client
                    .invoke(&self.settings.navigate_tool, args)
                    .await
                    .into_result()?;
                recorder.set_current_location(website);
            } else {
                tracing::warn!(
                    tool = %self.settings.navigate_tool,
                    "navigate tool not offered by provider, skipping initial navigation"
                );
                recorder.set_current_location(website);
            }
        }

        let attempts = self.settings.initial_artifact_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.capture_artifact(output_dir, recorder, 0, false).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "initial screenshot failed: {}", e);
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.artifact_retry_delay).await;
                    }
                }
            }
        }
        Err(RunError::InitialArtifact(format!(
            "after {attempts} attempts: {last_error}"
        )))
    }

    /// 截图并记录；工具进程未提供截图工具时跳过（Ok(None)）
    async fn capture_artifact(
        &self,
        output_dir: &std::path::Path,
        recorder: &mut TrajectoryRecorder,
        step: usize,
        is_final: bool,
    ) -> Result<Option<PathBuf>, String> {
        let tool = &self.settings.screenshot_tool;
        if self.client.get_schema(tool).is_none() {
            tracing::debug!(tool = %tool, "screenshot tool not offered, skipping artifact");
            return Ok(None);
        }
        let saved = match self
            .client
            .invoke(tool, args_of(json!({ "type": "png" })))
            .await
            .into_result()
        {
            Ok(result) => save_artifact(output_dir, step, is_final, &result).await,
            Err(e) => Err(e.to_string()),
        };
        match saved {
            Ok(path) => {
                recorder.record_artifact(step, &path);
                Ok(Some(path))
            }
            Err(e) => {
                recorder.note_artifact_failure();
                Err(e)
            }
        }
    }

    /// 当前页面快照；失败时退化为空快照
    async fn snapshot(&self) -> String {
        let tool = &self.settings.snapshot_tool;
        if self.client.get_schema(tool).is_none() {
            return String::new();
        }
        match self.client.invoke(tool, Map::new()).await.into_result() {
            Ok(result) => truncate_snapshot(&text_content(&result), self.settings.max_snapshot_chars),
            Err(e) => {
                tracing::warn!(kind = e.kind(), "snapshot failed: {}", e);
                String::new()
            }
        }
    }

    async fn current_tools(&self) -> Vec<ToolDescriptor> {
        match self.client.list_capabilities(false).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("tool list refresh failed, using cache: {}", e);
                self.client
                    .registry()
                    .map(|r| r.tools().to_vec())
                    .unwrap_or_default()
            }
        }
    }

    fn cancelled(&self) -> LoopEnd {
        let note = self.shutdown.cancel_note();
        tracing::warn!(step = self.steps, "{}", note);
        LoopEnd { success: false, note }
    }

    async fn step_loop(
        &mut self,
        task: &TaskSpec,
        output_dir: &std::path::Path,
        recorder: &mut TrajectoryRecorder,
    ) -> Result<LoopEnd, RunError> {
        let max_steps = task.max_steps.unwrap_or(self.settings.max_steps);
        let base_delay = task
            .step_delay
            .and_then(|d| Duration::try_from_secs_f64(d).ok())
            .unwrap_or(self.settings.step_delay);
        let mut pacer = StepPacer::new(base_delay);
        let cancel = self.shutdown.token();
        let mut feedback: Option<String> = None;
        let mut parse_errors = 0usize;

        for step in 1..=max_steps {
            if step > 1 {
                self.transition(RunPhase::Running(step));
            }
            self.steps = step;
            tracing::info!(task_id = %task.task_id, "step {}/{}", step, max_steps);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.cancelled());
                }
                _ = pacer.wait_before(step) => {}
            }

            let snapshot = self.snapshot().await;
            let request = DecisionRequest {
                step,
                task: (step == 1).then(|| task.brief()),
                snapshot,
                tools: self.current_tools().await,
                feedback: feedback.take(),
                screenshot: recorder.latest_artifact().map(|a| a.path.clone()),
            };

            let decided = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.cancelled());
                }
                r = tokio::time::timeout(self.settings.decision_timeout, self.decider.decide(&request)) => r,
            };
            let decision = match decided {
                Err(_) => {
                    return Err(DecisionError::Timeout(self.settings.decision_timeout.as_secs()).into());
                }
                Ok(Err(DecisionError::RateLimited(msg))) => {
                    let delay = pacer.on_rate_limited();
                    tracing::warn!(step, "decision maker rate limited: {}", msg);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(decision)) => {
                    pacer.on_success();
                    decision
                }
            };

            let (thought, tool, args) = match decision {
                Decision::Finish { thought } => {
                    recorder.append_thought(format!("Step {step}: {thought}"));
                    tracing::info!(step, "task completed by decision maker");
                    return Ok(LoopEnd {
                        success: true,
                        note: thought,
                    });
                }
                Decision::Invalid { reason, raw } => {
                    parse_errors += 1;
                    tracing::warn!(
                        step,
                        attempt = parse_errors,
                        limit = self.settings.max_consecutive_parse_errors,
                        raw = %raw.chars().take(200).collect::<String>(),
                        "unparseable decision ({})",
                        reason
                    );
                    if parse_errors >= self.settings.max_consecutive_parse_errors {
                        return Ok(LoopEnd {
                            success: false,
                            note: format!("Task failed after {parse_errors} consecutive parse errors"),
                        });
                    }
                    feedback = Some(format!(
                        "Your previous response could not be parsed ({reason}). Try again."
                    ));
                    continue;
                }
                Decision::Act { thought, tool, args } => (thought, tool, args),
            };
            parse_errors = 0;
            recorder.append_thought(format!("Step {step}: {thought}"));

            if is_close_tool(&tool) {
                tracing::warn!(step, tool = %tool, "close requested, intercepting");
                if let Err(e) = self.capture_artifact(output_dir, recorder, step, true).await {
                    tracing::warn!("final screenshot failed: {}", e);
                }
                recorder.record_action(format_action(&tool, &args));
                return Ok(LoopEnd {
                    success: true,
                    note: "Browser close requested".to_string(),
                });
            }

            let args_json = Value::Object(args.clone());
            tracing::info!(step, tool = %tool, args = %args_json, "executing");
            let result = self.client.invoke(&tool, args.clone()).await;
            match result.error() {
                None => {
                    if Verb::classify(&tool) == Verb::Navigate {
                        if let Some(url) = args.get("url").and_then(|u| u.as_str()) {
                            recorder.set_current_location(url);
                        }
                    }
                    recorder.record_action(format_action(&tool, &args));
                    if let Err(e) = self.capture_artifact(output_dir, recorder, step, false).await {
                        tracing::warn!(step, "screenshot failed: {}", e);
                    }
                }
                Some(e) => {
                    tracing::warn!(
                        step,
                        tool = %tool,
                        args = %args_json,
                        kind = e.kind(),
                        "action failed: {}",
                        e
                    );
                    feedback = Some(action_failure_feedback(&tool, &args, e));
                }
            }
        }

        tracing::info!(max_steps, "reached max steps without completion");
        Ok(LoopEnd {
            success: false,
            note: format!("Reached max steps ({max_steps}) without completion"),
        })
    }
}
