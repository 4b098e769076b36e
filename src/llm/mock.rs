//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设回复 / 工具调用 / 错误；脚本用完后回显最后一条 User 消息。
//! 流式路径把文本切成小段逐个产出，可选延迟与闸门（Notify）用来模拟“生成进行中”。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::Notify;

use super::traits::{ChatRequest, Completion, DeltaStream, LlmClient, LlmDelta, LlmError};
use crate::memory::{Role, ToolCall};

#[derive(Debug, Clone)]
enum MockStep {
    Reply(Completion),
    Fail(LlmError),
}

/// Mock 客户端：脚本化回复，脚本为空时回显用户最后一条消息
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<MockStep>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
    chunk_chars: usize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            chunk_chars: 4,
            ..Self::default()
        }
    }

    fn push(self, step: MockStep) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(MockStep::Reply(Completion {
            text: text.into(),
            tool_calls: Vec::new(),
        }))
    }

    pub fn reply_with_tools(self, text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        self.push(MockStep::Reply(Completion {
            text: text.into(),
            tool_calls,
        }))
    }

    pub fn fail(self, error: LlmError) -> Self {
        self.push(MockStep::Fail(error))
    }

    /// 每个流式片段之间的延迟
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次调用先等待闸门放行（notify_one 一次放行一次调用）
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn next_step(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let step = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match step {
            Some(MockStep::Reply(completion)) => Ok(completion),
            Some(MockStep::Fail(e)) => Err(e),
            None => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(Completion {
                    text: format!("Echo from Mock: {}", last_user),
                    tool_calls: Vec::new(),
                })
            }
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let completion = self.next_step(request).await?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(completion)
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError> {
        let completion = self.next_step(request).await?;
        let chars: Vec<char> = completion.text.chars().collect();
        let mut deltas: Vec<LlmDelta> = chars
            .chunks(self.chunk_chars.max(1))
            .map(|c| LlmDelta::Text(c.iter().collect()))
            .collect();
        if !completion.tool_calls.is_empty() {
            deltas.push(LlmDelta::ToolCalls(completion.tool_calls));
        }
        let delay = self.delay;
        Ok(Box::pin(stream::iter(deltas).then(move |d| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, LlmError>(d)
        })))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
