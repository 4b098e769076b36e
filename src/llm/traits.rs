//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream（流式增量）。
//! 一次调用的输入是系统提示词 + 历史消息 + 可用工具，输出是文本与（可选的）工具调用。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorKind;
use crate::memory::{Message, ToolCall};

/// 暴露给模型的一项能力
#[derive(Clone, Debug, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    pub parameters: Value,
}

/// 一次生成请求
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// 非流式完成的结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// 流式增量：文本片段，或在流末尾一次性给出拼装好的工具调用
#[derive(Clone, Debug, PartialEq)]
pub enum LlmDelta {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<LlmDelta, LlmError>> + Send>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out: {0}")]
    Timeout(String),

    #[error("LLM API returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM response decode error: {0}")]
    Decode(String),

    #[error("LLM not configured: {0}")]
    NotConfigured(String),

    #[error("LLM protocol error: {0}")]
    Protocol(String),
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Generation,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e.to_string())
        } else if e.is_decode() {
            LlmError::Decode(e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

/// LLM 客户端 trait：非流式完成与流式完成（返回增量流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError>;

    /// 流式完成，返回增量流
    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }
}
