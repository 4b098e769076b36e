//! 消费端对账：把来自实时流与补取轮询的事件幂等地合并成每个回合的视图
//!
//! 投递是至少一次：同一事件可能从两条路径各到一次。按 (message_id, seq) 去重，
//! 乱序到达的事件先缓存，按 seq 连续应用，因此重复应用同一 chunk / tool / done 不会改变结果。

use std::collections::{BTreeMap, HashMap};

use super::{EventKind, StreamEvent, SCHEDULER_MESSAGE_ID};
use crate::core::ErrorKind;
use crate::scheduler::SchedulerState;

/// 单个回合在客户端的视图
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnView {
    pub text: String,
    /// (能力名, 参数, 结果)
    pub tools: Vec<(String, String, String)>,
    pub record_index: Option<u64>,
    pub error: Option<(ErrorKind, String)>,
    /// done 表示替换了已有记录的尾部
    pub replaced: bool,
    pub followups: Vec<String>,
    next_seq: u64,
    pending: BTreeMap<u64, EventKind>,
}

impl TurnView {
    pub fn is_finished(&self) -> bool {
        self.record_index.is_some() || self.error.is_some()
    }

    fn apply_kind(&mut self, kind: EventKind) {
        match kind {
            EventKind::Chunk { content } => self.text.push_str(&content),
            EventKind::Replace { content } => self.text = content,
            EventKind::Tool {
                name,
                arguments,
                result,
                ..
            } => self.tools.push((name, arguments, result)),
            EventKind::Error { kind, content } => self.error = Some((kind, content)),
            EventKind::Done {
                record_index,
                response,
                replaced,
            } => {
                if let Some(response) = response {
                    self.text = response;
                }
                self.record_index = Some(record_index);
                self.replaced = replaced;
            }
            EventKind::AutoFollowup { message, .. } => self.followups.push(message),
            EventKind::SchedulerUpdate { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct TurnReconciler {
    turns: HashMap<String, TurnView>,
    scheduler: Option<(u64, SchedulerState)>,
}

impl TurnReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一个事件；返回 false 表示重复或已过时的事件（无任何效果）
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        if event.message_id == SCHEDULER_MESSAGE_ID {
            if let EventKind::SchedulerUpdate { scheduler } = &event.kind {
                let newer = self.scheduler.as_ref().map_or(true, |(seq, _)| event.seq > *seq);
                if newer {
                    self.scheduler = Some((event.seq, scheduler.clone()));
                }
                return newer;
            }
        }

        let view = self.turns.entry(event.message_id.clone()).or_default();
        if event.seq < view.next_seq || view.pending.contains_key(&event.seq) {
            return false;
        }
        view.pending.insert(event.seq, event.kind.clone());
        while let Some(kind) = view.pending.remove(&view.next_seq) {
            view.apply_kind(kind);
            view.next_seq += 1;
        }
        true
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a StreamEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn turn(&self, message_id: &str) -> Option<&TurnView> {
        self.turns.get(message_id)
    }

    pub fn scheduler(&self) -> Option<&SchedulerState> {
        self.scheduler.as_ref().map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64, kind: EventKind) -> StreamEvent {
        StreamEvent {
            message_id: "m1".into(),
            seq,
            kind,
        }
    }

    fn chunk(seq: u64, s: &str) -> StreamEvent {
        ev(seq, EventKind::Chunk { content: s.into() })
    }

    #[test]
    fn test_duplicates_from_both_surfaces_are_noops() {
        let live = vec![chunk(0, "ha"), chunk(1, "ha")];
        let done = ev(
            2,
            EventKind::Done {
                record_index: 0,
                response: Some("haha".into()),
                replaced: false,
            },
        );
        let mut r = TurnReconciler::new();
        r.apply_all(&live);
        // 轮询重新观察到已见过的事件
        assert!(!r.apply(&live[1]));
        assert!(r.apply(&done));
        assert!(!r.apply(&done));
        let view = r.turn("m1").unwrap();
        assert_eq!(view.text, "haha");
        assert_eq!(view.record_index, Some(0));
    }

    #[test]
    fn test_out_of_order_arrival_is_buffered() {
        let mut r = TurnReconciler::new();
        r.apply(&chunk(1, "ng"));
        assert_eq!(r.turn("m1").unwrap().text, "");
        r.apply(&chunk(0, "po"));
        assert_eq!(r.turn("m1").unwrap().text, "pong");
    }

    #[test]
    fn test_replace_overwrites() {
        let mut r = TurnReconciler::new();
        r.apply(&ev(0, EventKind::Replace { content: "draft".into() }));
        r.apply(&ev(1, EventKind::Replace { content: "final".into() }));
        assert_eq!(r.turn("m1").unwrap().text, "final");
    }

    #[test]
    fn test_scheduler_updates_keep_latest() {
        let mut r = TurnReconciler::new();
        let update = |seq, active| StreamEvent {
            message_id: SCHEDULER_MESSAGE_ID.into(),
            seq,
            kind: EventKind::SchedulerUpdate {
                scheduler: SchedulerState {
                    active,
                    ..SchedulerState::inactive()
                },
            },
        };
        assert!(r.apply(&update(1, true)));
        assert!(!r.apply(&update(0, false)));
        assert!(r.scheduler().unwrap().active);
    }
}
