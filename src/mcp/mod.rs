//! 工具进程协议层：行分隔 JSON-RPC 传输、子进程生命周期、握手、工具发现与调用

pub mod client;
pub mod content;
pub mod launcher;
pub mod message;
pub mod mock;
pub mod pending;
pub mod transport;

pub use client::{ClientConfig, InvocationResult, ProtocolClient};
pub use content::{image_data, text_content};
pub use launcher::{LaunchContext, Launched, Launcher, ProcessLauncher, ProviderProcess, ShutdownOutcome};
pub use mock::{MockEvent, MockLauncher, MockProvider, MockReply};
