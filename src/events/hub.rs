//! 事件分发：一个事件源，多个互不依赖的订阅面
//!
//! - 实时流：发起调用方附着的有序推送通道（无界，慢消费者不会阻塞生成）
//! - 补取队列：实时流未观察到的事件（或根本没有实时流时产生的事件），由低频轮询取走；有界，满时丢最旧
//! - 广播总线：所有事件的扇出（SSE 订阅者）
//!
//! 路由与实时流分离都在 live 锁内完成（锁顺序 live → catchup），因此同一 message_id 在两条路径上都保持发出顺序。

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{broadcast, mpsc};

use super::{EventKind, StreamEvent, SCHEDULER_MESSAGE_ID};
use crate::core::ErrorKind;
use crate::scheduler::SchedulerState;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct LiveSlot {
    attach_id: u64,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

pub struct EventHub {
    live: Mutex<HashMap<String, LiveSlot>>,
    next_attach_id: AtomicU64,
    catchup: Mutex<VecDeque<StreamEvent>>,
    capacity: usize,
    bus: broadcast::Sender<StreamEvent>,
    scheduler_seq: AtomicU64,
}

impl EventHub {
    pub fn new(catchup_capacity: usize, bus_capacity: usize) -> Arc<Self> {
        let (bus, _) = broadcast::channel(bus_capacity.max(1));
        Arc::new(Self {
            live: Mutex::new(HashMap::new()),
            next_attach_id: AtomicU64::new(0),
            catchup: Mutex::new(VecDeque::new()),
            capacity: catchup_capacity.max(1),
            bus,
            scheduler_seq: AtomicU64::new(0),
        })
    }

    /// 为一个回合创建发布端（seq 从 0 开始）
    pub fn publisher(self: &Arc<Self>, message_id: &str) -> TurnPublisher {
        TurnPublisher {
            hub: Arc::clone(self),
            message_id: message_id.to_string(),
            next_seq: 0,
            finished: false,
        }
    }

    /// 附着实时流；必须在该回合发布第一个事件前调用，否则之前的事件只会进入补取队列
    pub fn attach_live(self: &Arc<Self>, message_id: &str) -> LiveStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let attach_id = self.next_attach_id.fetch_add(1, Ordering::Relaxed);
        let previous = locked(&self.live).insert(message_id.to_string(), LiveSlot { attach_id, tx });
        if previous.is_some() {
            tracing::warn!(message_id, "replacing an existing live subscriber");
        }
        LiveStream {
            hub: Arc::clone(self),
            message_id: message_id.to_string(),
            attach_id,
            rx,
        }
    }

    pub fn has_live(&self, message_id: &str) -> bool {
        locked(&self.live).contains_key(message_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.bus.subscribe()
    }

    pub fn publish(&self, event: StreamEvent) {
        let _ = self.bus.send(event.clone());

        let mut live = locked(&self.live);
        let message_id = event.message_id.clone();
        let terminal = event.is_terminal();
        let undelivered = match live.get(&message_id) {
            Some(slot) => slot.tx.send(event).err().map(|mpsc::error::SendError(e)| e),
            None => Some(event),
        };
        // 实时消费者已离开，或终止事件之后不再有本回合事件：去掉发送端，实时流读完缓冲后结束
        if undelivered.is_some() || terminal {
            if live.remove(&message_id).is_some() && undelivered.is_some() {
                tracing::debug!(message_id = %message_id, "live consumer gone, routing to catch-up");
            }
        }
        if let Some(event) = undelivered {
            self.push_catchup(event);
        }
    }

    /// 调度器快照（message_id 固定为 "scheduler"，seq 为会话级计数）
    pub fn publish_scheduler(&self, state: SchedulerState) {
        let seq = self.scheduler_seq.fetch_add(1, Ordering::SeqCst);
        self.publish(StreamEvent {
            message_id: SCHEDULER_MESSAGE_ID.to_string(),
            seq,
            kind: EventKind::SchedulerUpdate { scheduler: state },
        });
    }

    /// 取走补取队列中的全部事件
    pub fn drain(&self) -> Vec<StreamEvent> {
        locked(&self.catchup).drain(..).collect()
    }

    pub fn clear_catchup(&self) {
        locked(&self.catchup).clear();
    }

    pub fn pending(&self) -> usize {
        locked(&self.catchup).len()
    }

    fn push_catchup(&self, event: StreamEvent) {
        let mut queue = locked(&self.catchup);
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    message_id = %dropped.message_id,
                    seq = dropped.seq,
                    kind = dropped.kind.name(),
                    "catch-up queue full, dropping oldest event"
                );
            }
        }
        queue.push_back(event);
    }

    /// 实时流分离：未被读走的缓冲事件按序转入补取队列
    fn detach(&self, message_id: &str, attach_id: u64, rx: &mut mpsc::UnboundedReceiver<StreamEvent>) {
        let mut live = locked(&self.live);
        if live.get(message_id).is_some_and(|slot| slot.attach_id == attach_id) {
            live.remove(message_id);
        }
        rx.close();
        let mut returned = 0usize;
        while let Ok(event) = rx.try_recv() {
            self.push_catchup(event);
            returned += 1;
        }
        if returned > 0 {
            tracing::info!(message_id, returned, "live consumer detached, events moved to catch-up");
        }
    }
}

/// 实时流：按发出顺序产出本回合事件，终止事件后结束；Drop 时把未读事件交还补取队列
pub struct LiveStream {
    hub: Arc<EventHub>,
    message_id: String,
    attach_id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl LiveStream {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Stream for LiveStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        let hub = Arc::clone(&self.hub);
        hub.detach(&self.message_id, self.attach_id, &mut self.rx);
    }
}

/// 回合发布端：分配 seq，保证终止事件恰好一个且位于最后
pub struct TurnPublisher {
    hub: Arc<EventHub>,
    message_id: String,
    next_seq: u64,
    finished: bool,
}

impl TurnPublisher {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn emit(&mut self, kind: EventKind) {
        if self.finished {
            tracing::debug!(message_id = %self.message_id, kind = kind.name(), "event after terminal ignored");
            return;
        }
        self.finished = kind.is_terminal();
        let event = StreamEvent {
            message_id: self.message_id.clone(),
            seq: self.next_seq,
            kind,
        };
        self.next_seq += 1;
        self.hub.publish(event);
    }

    pub fn chunk(&mut self, content: impl Into<String>) {
        let content = content.into();
        if !content.is_empty() {
            self.emit(EventKind::Chunk { content });
        }
    }

    pub fn replace(&mut self, content: impl Into<String>) {
        self.emit(EventKind::Replace {
            content: content.into(),
        });
    }

    pub fn tool(&mut self, tool_call_id: &str, name: &str, arguments: &str, result: &str) {
        self.emit(EventKind::Tool {
            tool_call_id: tool_call_id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
            result: result.to_string(),
        });
    }

    pub fn error(&mut self, kind: ErrorKind, content: impl Into<String>) {
        self.emit(EventKind::Error {
            kind,
            content: content.into(),
        });
    }

    pub fn done(&mut self, record_index: u64, response: Option<String>, replaced: bool) {
        self.emit(EventKind::Done {
            record_index,
            response,
            replaced,
        });
    }

    /// 自主回合结束后的提示消息；在终止事件之后发出，总是进入补取队列（没有实时流）
    pub fn auto_followup(mut self, message: impl Into<String>) {
        let event = StreamEvent {
            message_id: self.message_id.clone(),
            seq: self.next_seq,
            kind: EventKind::AutoFollowup {
                message: message.into(),
                timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            },
        };
        self.next_seq += 1;
        self.hub.publish(event);
    }
}
