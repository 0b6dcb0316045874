//! 基于 LLM 的决策方
//!
//! 第一步（带任务说明）开启新对话，之后在同一对话中继续；历史只保留首条任务消息与最近若干轮，避免快照撑爆上下文。
//! 最近一张截图以 data URL 附在本步 user 消息上，不进入历史。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;

use crate::core::DecisionError;
use crate::decision::parser::parse_decision;
use crate::decision::prompt::{step_prompt, system_prompt};
use crate::decision::types::{Decision, DecisionMaker, DecisionRequest};
use crate::llm::{LlmClient, Message};

const DEFAULT_HISTORY_TURNS: usize = 4;

pub struct LlmDecisionMaker {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    history: Mutex<Vec<Message>>,
    history_turns: usize,
}

impl LlmDecisionMaker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt(),
            history: Mutex::new(Vec::new()),
            history_turns: DEFAULT_HISTORY_TURNS,
        }
    }

    /// 保留的最近轮数（每轮 = user + assistant）
    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns;
        self
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 组装本次调用的消息：system + 首条任务消息 + 最近若干轮 + 本次 user
    fn build_messages(&self, user: Message, new_conversation: bool) -> Vec<Message> {
        let mut history = self.lock_history();
        if new_conversation {
            history.clear();
        }
        let mut messages = vec![Message::system(self.system_prompt.clone())];
        if let Some(first) = history.first() {
            messages.push(first.clone());
        }
        let keep = self.history_turns * 2;
        let tail_start = history.len().saturating_sub(keep).max(1);
        if history.len() > 1 {
            messages.extend(history[tail_start..].iter().cloned());
        }
        messages.push(user);
        messages
    }

    fn remember(&self, user: String, reply: String) {
        let mut history = self.lock_history();
        history.push(Message::user(user));
        history.push(Message::assistant(reply));
    }
}

#[async_trait]
impl DecisionMaker for LlmDecisionMaker {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, DecisionError> {
        let user = step_prompt(request);
        let mut current = Message::user(user.clone());
        if let Some(path) = &request.screenshot {
            match image_data_url(path).await {
                Ok(url) => current = current.with_image(url),
                Err(e) => tracing::warn!(
                    step = request.step,
                    path = %path.display(),
                    "screenshot not attached: {}",
                    e
                ),
            }
        }
        let messages = self.build_messages(current, request.task.is_some());
        tracing::debug!(
            step = request.step,
            messages = messages.len(),
            preview = %user.chars().take(300).collect::<String>(),
            "sending decision request"
        );

        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(DecisionError::classify)?;
        tracing::info!(step = request.step, response = %reply, "decision response");

        let decision = parse_decision(&reply);
        self.remember(user, reply);
        Ok(decision)
    }
}

/// 读取图片文件并编码为 data URL
async fn image_data_url(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}
