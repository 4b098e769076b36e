//! 会话错误类型与错误分类
//!
//! ErrorKind 是贯穿 error 事件的结构化分类；文本匹配的超时判断只作为无法结构化分类时的兜底。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::HistoryError;

/// 错误分类（随 error 事件下发给客户端）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 传输 / 超时：可恢复，稍后的 done 或补取事件仍可能了结该回合
    Timeout,
    /// 生成失败（上游、工具）：不自动重试，不提交部分记录
    Generation,
    /// 坐标无效（编辑 / 重试引用了不存在的记录或消息）
    Coordinates,
    /// 持久化写入失败
    Persistence,
    /// 会话锁被占用
    Busy,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Generation => "generation",
            ErrorKind::Coordinates => "coordinates",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Busy => "busy",
        }
    }
}

/// 会话层错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session busy: generation {holder} is in flight")]
    Busy { holder: String },

    #[error("Record {record_index} not found")]
    RecordNotFound { record_index: u64 },

    #[error("Message id '{message_id}' is reserved")]
    ReservedMessageId { message_id: String },

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Config error: {0}")]
    Config(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Busy { .. } => ErrorKind::Busy,
            SessionError::RecordNotFound { .. } | SessionError::ReservedMessageId { .. } => ErrorKind::Coordinates,
            SessionError::History(e) => e.kind(),
            SessionError::Config(_) => ErrorKind::Generation,
        }
    }
}

impl HistoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::NotFound { .. } => ErrorKind::Coordinates,
            _ => ErrorKind::Persistence,
        }
    }
}

const TIMEOUT_MARKERS: [&str; 4] = ["timeout", "timed out", "etimedout", "readtimeout"];

/// 仅凭错误文本判断是否为超时（大小写不敏感）；可能误判
pub fn looks_like_timeout(text: &str) -> bool {
    let lower = text.to_lowercase();
    TIMEOUT_MARKERS.iter().any(|m| lower.contains(m))
}

/// 结构化信号优先；没有时才退回文本匹配
pub fn classify(structured: Option<ErrorKind>, text: &str) -> ErrorKind {
    match structured {
        Some(kind) => kind,
        None if looks_like_timeout(text) => ErrorKind::Timeout,
        None => ErrorKind::Generation,
    }
}
