//! 主控循环集成测试：内存模拟工具进程 + 脚本化 LLM

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use trailmark::core::{
        DecisionError, RunOutcome, RunPhase, RunSettings, ShutdownManager, ShutdownReason,
        StepOrchestrator,
    };
    use trailmark::decision::{Decision, DecisionMaker, DecisionRequest, LlmDecisionMaker};
    use trailmark::llm::MockLlmClient;
    use trailmark::mcp::mock::{browser_tools, install_tool};
    use trailmark::mcp::{ClientConfig, MockLauncher, MockProvider, MockReply, ProtocolClient};
    use trailmark::task::TaskSpec;
    use trailmark::trajectory::persistence::load_session_value;

    const TYPE_DEST: &str = r#"<json>{"thought": "Fill in the destination", "tool": "browser_type", "params": {"element": "Destination", "ref": "s8", "text": "Las Vegas"}}</json>"#;
    const CLICK_SEARCH: &str = r#"<json>{"thought": "Submit the search", "tool": "browser_click", "params": {"element": "Search", "ref": "s12"}}</json>"#;
    const HOVER_SEARCH: &str = r#"<json>{"thought": "Check the button", "tool": "browser_hover", "params": {"element": "Search", "ref": "s12"}}</json>"#;
    const FINISH: &str = r#"<json>{"thought": "Flights are listed", "tool": "finish", "params": {}}</json>"#;

    fn settings(output_root: &Path) -> RunSettings {
        RunSettings {
            max_steps: 3,
            step_delay: Duration::ZERO,
            output_root: output_root.to_path_buf(),
            decision_timeout: Duration::from_secs(5),
            artifact_retry_delay: Duration::from_millis(10),
            ..RunSettings::default()
        }
    }

    fn task() -> TaskSpec {
        TaskSpec::new("flight_001", "Find flights to Las Vegas").with_website("https://example.com")
    }

    fn client(launcher: Arc<MockLauncher>) -> ProtocolClient {
        let config = ClientConfig {
            handshake_timeout: Duration::from_secs(2),
            invoke_timeout: Duration::from_millis(300),
            stop_grace: Duration::from_millis(200),
            ..ClientConfig::default()
        };
        ProtocolClient::new(launcher, config)
    }

    async fn run_with(
        provider: MockProvider,
        llm: Arc<MockLlmClient>,
        settings: RunSettings,
    ) -> (RunOutcome, Arc<MockLauncher>) {
        let launcher = Arc::new(MockLauncher::new(provider));
        let decider = Arc::new(LlmDecisionMaker::new(llm));
        let mut orchestrator = StepOrchestrator::new(client(launcher.clone()), decider, settings);
        let outcome = orchestrator.run(&task()).await;
        assert_eq!(orchestrator.phase(), outcome.phase);
        assert!(!orchestrator.client().is_initialized());
        (outcome, launcher)
    }

    #[tokio::test]
    async fn test_timed_out_action_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::browser().with_reply("browser_click", MockReply::Silent);
        let llm = Arc::new(MockLlmClient::with_replies([TYPE_DEST, CLICK_SEARCH, HOVER_SEARCH]));
        let (outcome, launcher) = run_with(provider, llm.clone(), settings(dir.path())).await;

        assert_eq!(outcome.phase, RunPhase::Closed);
        assert!(!outcome.success);
        assert_eq!(outcome.steps, 3);
        let actions: Vec<String> = outcome
            .record
            .action_history
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(actions, vec!["<Destination> -> TYPE: Las Vegas", "<Search> -> HOVER"]);
        assert_eq!(outcome.record.metadata.total_steps, 3);
        assert_eq!(outcome.record.metadata.final_url, "https://example.com");

        // 初始导航 + 截图，随后每步快照
        let calls = launcher.provider().calls();
        assert_eq!(calls[0].0, "browser_navigate");
        assert_eq!(calls[0].1["url"], "https://example.com");
        assert!(calls.iter().any(|(name, _)| name == "browser_click"));

        // 第 3 步的请求带有超时反馈
        let requests = llm.requests();
        assert_eq!(requests.len(), 3);
        let third = &requests[2].last().unwrap().content;
        assert!(third.contains("ERROR IN PREVIOUS RESPONSE"));
        assert!(third.contains("Tool: browser_click"));

        // step 0 / 1 / 3 各一张截图
        assert_eq!(outcome.record.screenshots.len(), 3);
        for name in ["step_000.png", "step_001.png", "step_003.png"] {
            assert!(outcome.output_dir.join("trajectory").join(name).exists(), "{name}");
        }
        assert!(!outcome.output_dir.join("trajectory").join("step_002.png").exists());
    }

    #[tokio::test]
    async fn test_finish_writes_result_file() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(MockLlmClient::with_replies([TYPE_DEST, FINISH]));
        let (outcome, _launcher) =
            run_with(MockProvider::browser(), llm.clone(), settings(dir.path())).await;

        assert_eq!(outcome.phase, RunPhase::Closed);
        assert!(outcome.success);
        assert_eq!(outcome.steps, 2);
        assert!(outcome.error.is_none());

        let path = outcome.result_path.clone().unwrap();
        assert!(path.starts_with(dir.path()));
        let saved = load_session_value(&path).await.unwrap();
        assert_eq!(saved["task_id"], "flight_001");
        assert_eq!(saved["task"], "Find flights to Las Vegas");
        assert_eq!(saved["final_result_response"], "Flights are listed");
        assert_eq!(saved["action_history"][0], "<Destination> -> TYPE: Las Vegas");
        assert_eq!(saved["thoughts"][0], "Step 1: Fill in the destination");
        assert_eq!(saved["thoughts"][1], "Step 2: Flights are listed");
        assert_eq!(saved["metadata"]["total_steps"], 2);
        assert_eq!(saved["metadata"]["screenshot_count"], 2);

        // 只有第一步带任务说明
        let requests = llm.requests();
        assert!(requests[0].last().unwrap().content.contains("TASK: Find flights to Las Vegas"));
        assert!(!requests[1].last().unwrap().content.contains("TASK:"));

        // 每步附带最近一张截图
        for request in &requests {
            let images = &request.last().unwrap().images;
            assert_eq!(images.len(), 1);
            assert!(images[0].starts_with("data:image/png;base64,"));
        }
    }

    #[tokio::test]
    async fn test_out_of_range_task_step_delay_uses_configured_delay() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new(MockProvider::browser()));
        let llm = Arc::new(MockLlmClient::with_replies([TYPE_DEST, FINISH]));
        let mut orchestrator = StepOrchestrator::new(
            client(launcher),
            Arc::new(LlmDecisionMaker::new(llm)),
            settings(dir.path()),
        );
        let mut spec = task();
        spec.step_delay = Some(f64::MAX);
        let outcome = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(&spec))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.steps, 2);
    }

    #[tokio::test]
    async fn test_setup_tool_runs_before_navigation() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::browser();
        let mut tools = browser_tools();
        tools.push(install_tool());
        provider.set_tools(tools);
        let llm = Arc::new(MockLlmClient::with_replies([FINISH]));
        let (outcome, launcher) = run_with(provider, llm, settings(dir.path())).await;

        assert!(outcome.success);
        let calls = launcher.provider().calls();
        assert_eq!(calls[0].0, "browser_install");
        assert_eq!(calls[1].0, "browser_navigate");
    }

    #[tokio::test]
    async fn test_setup_tool_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::browser()
            .with_reply("browser_install", MockReply::ToolError("download failed".into()));
        let mut tools = browser_tools();
        tools.push(install_tool());
        provider.set_tools(tools);
        let llm = Arc::new(MockLlmClient::with_replies([FINISH]));
        let (outcome, launcher) = run_with(provider, llm, settings(dir.path())).await;

        assert_eq!(outcome.phase, RunPhase::Closed);
        assert!(outcome.success);
        assert_eq!(launcher.provider().calls()[1].0, "browser_navigate");
    }

    #[tokio::test]
    async fn test_close_is_intercepted() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(MockLlmClient::with_replies([
            r#"<json>{"thought": "All done, closing", "tool": "browser_close", "params": {}}</json>"#,
        ]));
        let (outcome, launcher) =
            run_with(MockProvider::browser(), llm, settings(dir.path())).await;

        assert_eq!(outcome.phase, RunPhase::Closed);
        assert!(outcome.success);
        assert!(launcher
            .provider()
            .calls()
            .iter()
            .all(|(name, _)| name != "browser_close"));
        let last = outcome.record.action_history.last().unwrap().to_string();
        assert!(last.ends_with("BROWSER_CLOSE"), "{last}");
        assert!(outcome
            .output_dir
            .join("trajectory")
            .join("step_001_final.png")
            .exists());
    }

    #[tokio::test]
    async fn test_consecutive_parse_errors_end_the_run() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(MockLlmClient::with_replies([
            "I am not sure what to do",
            "Let me think about it",
            "still thinking",
        ]));
        let mut run_settings = settings(dir.path());
        run_settings.max_steps = 10;
        let (outcome, launcher) =
            run_with(MockProvider::browser(), llm.clone(), run_settings).await;

        assert_eq!(outcome.phase, RunPhase::Closed);
        assert!(!outcome.success);
        assert_eq!(outcome.steps, 3);
        assert!(outcome.error.unwrap().contains("3 consecutive parse errors"));
        assert!(outcome.record.action_history.is_empty());
        let dispatched: Vec<String> = launcher
            .provider()
            .calls()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !matches!(name.as_str(), "browser_navigate" | "browser_snapshot" | "browser_take_screenshot"))
            .collect();
        assert!(dispatched.is_empty(), "{dispatched:?}");

        let second = &llm.requests()[1];
        assert!(second
            .last()
            .unwrap()
            .content
            .contains("could not be parsed (parse_failure)"));
    }

    #[tokio::test]
    async fn test_validation_failure_feeds_back() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(MockLlmClient::with_replies([
            r#"<json>{"thought": "Click search", "tool": "browser_click", "params": {"element": "Search"}}</json>"#,
            CLICK_SEARCH,
            FINISH,
        ]));
        let (outcome, launcher) =
            run_with(MockProvider::browser(), llm.clone(), settings(dir.path())).await;

        assert!(outcome.success);
        assert_eq!(outcome.record.action_history.len(), 1);
        let clicks = launcher
            .provider()
            .calls()
            .into_iter()
            .filter(|(name, _)| name == "browser_click")
            .count();
        assert_eq!(clicks, 1);
        let requests = llm.requests();
        let second = &requests[1].last().unwrap().content;
        assert!(second.contains("Missing required field: 'ref'"));
        assert!(second.contains("AVAILABLE TOOLS"));
    }

    #[tokio::test]
    async fn test_rate_limit_consumes_a_step() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_error("429 Too Many Requests");
        llm.push_reply(FINISH);
        let (outcome, _launcher) =
            run_with(MockProvider::browser(), llm.clone(), settings(dir.path())).await;

        assert!(outcome.success);
        assert_eq!(outcome.steps, 2);
        assert_eq!(llm.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_startup_failure_still_produces_record() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::failing("provider binary missing"));
        let llm = Arc::new(MockLlmClient::new());
        let mut orchestrator = StepOrchestrator::new(
            client(launcher),
            Arc::new(LlmDecisionMaker::new(llm.clone())),
            settings(dir.path()),
        );
        let outcome = orchestrator.run(&task()).await;

        assert_eq!(outcome.phase, RunPhase::Failed);
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("provider binary missing"));
        assert!(outcome.record.action_history.is_empty());
        assert!(outcome.result_path.unwrap().exists());
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_initial_screenshot_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::browser();
        for _ in 0..3 {
            provider.push_reply("browser_take_screenshot", MockReply::ToolError("no page".into()));
        }
        let llm = Arc::new(MockLlmClient::new());
        let (outcome, _launcher) = run_with(provider, llm.clone(), settings(dir.path())).await;

        assert_eq!(outcome.phase, RunPhase::Failed);
        assert!(outcome.error.unwrap().contains("Initial artifact"));
        assert_eq!(outcome.record.metadata.screenshot_failures, 3);
        assert!(llm.requests().is_empty());
    }

    struct HangingDecider;

    #[async_trait]
    impl DecisionMaker for HangingDecider {
        async fn decide(&self, _request: &DecisionRequest) -> Result<Decision, DecisionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(DecisionError::Transport("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_decision_timeout_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new(MockProvider::browser()));
        let mut run_settings = settings(dir.path());
        run_settings.decision_timeout = Duration::from_millis(100);
        let mut orchestrator =
            StepOrchestrator::new(client(launcher), Arc::new(HangingDecider), run_settings);
        let outcome = orchestrator.run(&task()).await;

        assert_eq!(outcome.phase, RunPhase::Failed);
        assert_eq!(outcome.steps, 1);
        assert!(!orchestrator.client().is_initialized());
        assert!(outcome.result_path.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(MockLauncher::new(MockProvider::browser()));
        let shutdown = ShutdownManager::new();
        shutdown.shutdown(ShutdownReason::Signal);
        let llm = Arc::new(MockLlmClient::new());
        let mut orchestrator = StepOrchestrator::new(
            client(launcher),
            Arc::new(LlmDecisionMaker::new(llm.clone())),
            settings(dir.path()),
        )
        .with_shutdown(shutdown);
        let outcome = orchestrator.run(&task()).await;

        assert_eq!(outcome.phase, RunPhase::Closed);
        assert!(!outcome.success);
        assert!(llm.requests().is_empty());
        assert_eq!(outcome.error.as_deref(), Some("Run cancelled: terminated by SIGTERM"));
        assert_eq!(
            outcome.record.final_result_response,
            "Run cancelled: terminated by SIGTERM"
        );
        assert!(outcome.result_path.is_some());
    }
}
