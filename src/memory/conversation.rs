//! 对话数据模型：消息、工具调用与单回合记录
//!
//! 一条 ChatRecord 对应一个回合（通常 user → assistant [→ tool → assistant]*）。
//! tool 消息的 tool_call_id 必须能在同一记录内、紧邻其前的 assistant 消息中找到。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::HistoryError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// assistant 消息发起的一次能力调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 序列化后的参数（JSON 文本）
    pub arguments: String,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::assistant(content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// 回合来源
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    #[default]
    User,
    /// 空输入触发的主动追问
    Nudge,
    /// 调度器到期自动触发
    Scheduled,
    /// 启动时历史为空的问候
    Greeting,
}

/// 一个回合的持久化记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub record_index: u64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub origin: TurnOrigin,
    pub messages: Vec<Message>,
}

impl ChatRecord {
    /// 开头的 user 消息（若有）
    pub fn leading_user(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::User)
    }

    /// 重试时保留的前缀长度：有开头 user 消息时保留它，否则整条替换
    pub fn head_len(&self) -> usize {
        usize::from(self.leading_user().is_some())
    }

    /// 回合内 assistant 文本按顺序拼接（与流式 chunk 拼接结果一致）
    pub fn response_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .collect()
    }

    /// 校验工具调用引用：每条 tool 消息都能在紧邻其前的 assistant 消息中找到
    pub fn validate(&self) -> Result<(), HistoryError> {
        ToolCallIndex::build(self.record_index, &self.messages).map(|_| ())
    }
}

/// 记录内的工具调用索引（tool_call_id → 能力名），回放 / 校验时临时构建，不单独持久化
#[derive(Debug, Default)]
pub struct ToolCallIndex {
    names: HashMap<String, String>,
}

impl ToolCallIndex {
    pub fn build(record_index: u64, messages: &[Message]) -> Result<Self, HistoryError> {
        let mut index = Self::default();
        // 当前可被引用的调用：仅来自最近一条 assistant 消息
        let mut open: HashMap<&str, &str> = HashMap::new();
        for message in messages {
            match message.role {
                Role::Assistant => {
                    open = message
                        .tool_calls
                        .iter()
                        .map(|c| (c.id.as_str(), c.name.as_str()))
                        .collect();
                }
                Role::Tool => {
                    let id = message.tool_call_id.as_deref().unwrap_or_default();
                    let name = open.get(id).ok_or_else(|| HistoryError::DanglingToolCall {
                        record_index,
                        tool_call_id: id.to_string(),
                    })?;
                    index.names.insert(id.to_string(), name.to_string());
                }
                Role::User => open.clear(),
            }
        }
        Ok(index)
    }

    pub fn name_of(&self, tool_call_id: &str) -> Option<&str> {
        self.names.get(tool_call_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
