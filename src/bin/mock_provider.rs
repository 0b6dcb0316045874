//! 本地模拟工具进程：在 stdin/stdout 上提供浏览器风格工具，用于集成测试与离线演练
//!
//! 选项：
//! - `--exit-immediately <code>`：向 stderr 写一行后以指定退出码退出
//! - `--ignore-sigterm`：忽略 SIGTERM（只能被强制结束），隐含 `--linger`
//! - `--linger`：stdin 关闭后不退出

use std::time::Duration;

use trailmark::mcp::MockProvider;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if let Some(pos) = args.iter().position(|a| a == "--exit-immediately") {
        let code = args
            .get(pos + 1)
            .and_then(|c| c.parse::<i32>().ok())
            .unwrap_or(1);
        eprintln!("mock provider: exiting immediately with code {code}");
        std::process::exit(code);
    }

    let ignore_sigterm = args.iter().any(|a| a == "--ignore-sigterm");
    let linger = ignore_sigterm || args.iter().any(|a| a == "--linger");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if ignore_sigterm {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::spawn(async move {
                        while sigterm.recv().await.is_some() {
                            eprintln!("mock provider: ignoring SIGTERM");
                        }
                    });
                }
                Err(e) => eprintln!("mock provider: cannot install SIGTERM handler: {e}"),
            }
        }
    }

    eprintln!("mock provider: ready");
    MockProvider::browser()
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await;

    if linger {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}
