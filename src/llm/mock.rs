//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 可按顺序预置若干条回复；预置耗尽后回退到「回显最后一条 User 消息」。
//! 也可预置失败，用于演练超时/重试路径。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatRole, LlmClient, LlmError};

type CannedReply = Result<String, LlmError>;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    canned: Mutex<VecDeque<CannedReply>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条成功回复（按 push 顺序消费）
    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut canned) = self.canned.lock() {
            canned.push_back(Ok(reply.into()));
        }
    }

    /// 预置一条失败
    pub fn push_failure(&self, err: LlmError) {
        if let Ok(mut canned) = self.canned.lock() {
            canned.push_back(Err(err));
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        if let Ok(mut canned) = self.canned.lock() {
            if let Some(reply) = canned.pop_front() {
                return reply;
            }
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(sin mensaje)");
        Ok(format!("¡Qué interesante! Cuéntame más sobre: {last_user}"))
    }
}
