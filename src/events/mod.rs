//! 流式事件：一个回合（message_id）产出的有序事件，NDJSON 每行一个
//!
//! 同一事件源经 EventHub 分发到实时流、补取队列与广播总线；消费者按 (message_id, seq) 幂等应用。

pub mod hub;
pub mod reconcile;

use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;
use crate::scheduler::SchedulerState;

pub use hub::{EventHub, LiveStream, TurnPublisher};
pub use reconcile::{TurnReconciler, TurnView};

/// 调度器事件使用的固定 message_id
pub const SCHEDULER_MESSAGE_ID: &str = "scheduler";

/// 线上事件：公共字段 + 按 type 区分的变体字段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub message_id: String,
    /// 同一 message_id 内从 0 递增
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// 追加的增量文本
    Chunk { content: String },
    /// 覆盖到目前为止的全部文本（仅非流式路径）
    Replace { content: String },
    /// 一次能力调用及其结果，结果可用后一次性上报
    Tool {
        tool_call_id: String,
        name: String,
        arguments: String,
        result: String,
    },
    /// 失败或超时（终止事件）
    Error { kind: ErrorKind, content: String },
    /// 成功（终止事件），record_index 为写入后的状态
    Done {
        record_index: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        /// 重试回合：替换了该记录的尾部，而不是新增记录
        #[serde(default)]
        replaced: bool,
    },
    SchedulerUpdate { scheduler: SchedulerState },
    /// 自主触发产生的提示消息，不属于任何实时流
    AutoFollowup { message: String, timestamp: String },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Done { .. } | EventKind::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Chunk { .. } => "chunk",
            EventKind::Replace { .. } => "replace",
            EventKind::Tool { .. } => "tool",
            EventKind::Error { .. } => "error",
            EventKind::Done { .. } => "done",
            EventKind::SchedulerUpdate { .. } => "scheduler_update",
            EventKind::AutoFollowup { .. } => "auto_followup",
        }
    }
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// 编码为 NDJSON 的一行（含换行符）
    pub fn to_ndjson(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => format!("{}\n", line),
            Err(e) => {
                tracing::warn!("event encode failed: {}", e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_flat() {
        let ev = StreamEvent {
            message_id: "m1".into(),
            seq: 3,
            kind: EventKind::Done {
                record_index: 0,
                response: Some("pong".into()),
                replaced: false,
            },
        };
        let json: serde_json::Value = serde_json::from_str(ev.to_ndjson().trim_end()).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["message_id"], "m1");
        assert_eq!(json["record_index"], 0);
        assert_eq!(json["response"], "pong");
        assert!(ev.to_ndjson().ends_with('\n'));
    }

    #[test]
    fn test_decode_error_line() {
        let line = r#"{"type":"error","message_id":"m9","seq":1,"kind":"timeout","content":"read timed out"}"#;
        let ev: StreamEvent = serde_json::from_str(line).unwrap();
        assert!(ev.is_terminal());
        assert_eq!(
            ev.kind,
            EventKind::Error {
                kind: ErrorKind::Timeout,
                content: "read timed out".into()
            }
        );
    }
}
