//! 会话锁：同一时刻至多一个进行中的生成
//!
//! 用户发送、nudge、重试与调度触发都通过 try_acquire 竞争；被占用时直接拒绝，不排队。
//! LockGuard 随生成任务移动，release 或 Drop 时恰好释放一次。锁只存在于内存中，进程重启即为空闲。

use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::SessionError;

#[derive(Debug, Default)]
pub struct SessionLock {
    holder: Mutex<Option<String>>,
}

impl SessionLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        // 临界区内没有会 panic 的代码，中毒时直接沿用内部值
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 尝试以 message_id 的身份占用锁
    pub fn try_acquire(self: &Arc<Self>, message_id: &str) -> Result<LockGuard, SessionError> {
        let mut slot = self.slot();
        if let Some(holder) = slot.as_ref() {
            return Err(SessionError::Busy {
                holder: holder.clone(),
            });
        }
        *slot = Some(message_id.to_string());
        tracing::debug!(message_id, "session lock acquired");
        Ok(LockGuard {
            lock: Arc::clone(self),
            message_id: message_id.to_string(),
            released: false,
        })
    }

    pub fn holder(&self) -> Option<String> {
        self.slot().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }
}

/// 锁的持有凭证
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<SessionLock>,
    message_id: String,
    released: bool,
}

impl LockGuard {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut slot = self.lock.slot();
        if slot.as_deref() == Some(self.message_id.as_str()) {
            *slot = None;
            tracing::debug!(message_id = %self.message_id, "session lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
