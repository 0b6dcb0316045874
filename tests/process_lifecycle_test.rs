//! 真实子进程生命周期测试（trailmark-mock-provider 二进制）

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Map, Value};
    use trailmark::core::ClientError;
    use trailmark::mcp::{
        text_content, ClientConfig, LaunchContext, Launcher, ProcessLauncher, ProtocolClient,
        ShutdownOutcome,
    };

    const MOCK_PROVIDER: &str = env!("CARGO_BIN_EXE_trailmark-mock-provider");

    fn launcher(args: &[&str]) -> ProcessLauncher {
        ProcessLauncher::new(MOCK_PROVIDER, args.iter().map(|a| a.to_string()).collect())
            .with_startup_grace(Duration::from_millis(300))
    }

    fn config() -> ClientConfig {
        ClientConfig {
            handshake_timeout: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_real_process_start_invoke_stop() {
        let client = ProtocolClient::new(Arc::new(launcher(&[])), config());
        client.start().await.unwrap();
        assert!(client.is_ready());

        let nav = client
            .invoke("browser_navigate", args(json!({"url": "https://example.com/flights"})))
            .await;
        assert!(nav.success(), "{:?}", nav.error());

        let snapshot = client
            .invoke("browser_snapshot", Map::new())
            .await
            .into_result()
            .unwrap();
        let text = text_content(&snapshot);
        assert!(text.contains("https://example.com/flights"));
        assert!(text.contains("[ref=s12]"));

        client.stop().await;
        assert!(!client.is_initialized());
        client.stop().await;
    }

    #[tokio::test]
    async fn test_immediate_exit_is_startup_failure_with_stderr() {
        let client = ProtocolClient::new(Arc::new(launcher(&["--exit-immediately", "3"])), config());
        match client.start().await {
            Err(ClientError::StartupFailure(msg)) => {
                assert!(msg.contains("exiting immediately with code 3"), "{msg}");
            }
            other => panic!("expected startup failure, got {other:?}"),
        }
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn test_user_data_dir_is_created_and_removed() {
        let client = ProtocolClient::new(
            Arc::new(launcher(&["--linger", "--user-data-dir", "{user_data_dir}"])),
            config(),
        );
        client.start().await.unwrap();
        let dir = std::env::temp_dir().join(format!("trailmark_{}", client.instance_id()));
        assert!(dir.is_dir());

        client.stop().await;
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_then_exit() {
        let ctx = LaunchContext {
            instance_id: "provider_lifecycle".into(),
        };
        let mut launched = launcher(&["--linger"]).launch(&ctx).await.unwrap();
        let mut process = launched.process.take().unwrap();
        assert!(process.id().is_some());
        assert_eq!(
            process.shutdown(Duration::from_secs(3)).await,
            ShutdownOutcome::Terminated
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_grace_when_sigterm_ignored() {
        let ctx = LaunchContext {
            instance_id: "provider_stubborn".into(),
        };
        let mut launched = launcher(&["--ignore-sigterm"]).launch(&ctx).await.unwrap();
        let mut process = launched.process.take().unwrap();
        assert_eq!(
            process.shutdown(Duration::from_millis(300)).await,
            ShutdownOutcome::Killed
        );
        assert!(process.try_status().is_some());
    }

    #[tokio::test]
    async fn test_client_stop_escalates_for_stubborn_provider() {
        let client = ProtocolClient::new(Arc::new(launcher(&["--ignore-sigterm"])), config());
        client.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .unwrap();
        assert!(!client.is_initialized());
    }
}
