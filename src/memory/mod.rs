//! 记忆层：对话数据模型、只追加的历史存储与 JSON 持久化

pub mod conversation;
pub mod history;
pub mod persistence;

use thiserror::Error;

pub use conversation::{ChatRecord, Message, Role, ToolCall, ToolCallIndex, TurnOrigin};
pub use history::HistoryStore;
pub use persistence::JsonFile;

/// 历史存储错误
#[derive(Error, Debug)]
pub enum HistoryError {
    /// 坐标不存在（message_index 为 None 表示记录本身不存在）
    #[error("Not found: record {record_index}, message {message_index:?}")]
    NotFound {
        record_index: u64,
        message_index: Option<usize>,
    },

    #[error("Record {record_index}: tool message references unknown call '{tool_call_id}'")]
    DanglingToolCall {
        record_index: u64,
        tool_call_id: String,
    },

    #[error("History is not contiguous: expected record {expected}, found {found}")]
    Discontiguous { expected: u64, found: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
