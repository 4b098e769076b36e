//! 调度器：持有一个循环 / 单次截止时间，到期时由 Session 自主触发生成
//!
//! 状态机：inactive → active（配置截止时间）；active → firing（now ≥ deadline 且会话锁空闲，
//! 锁被占用时留到下一次轮询）；firing 之后 interval_minutes > 0 则 deadline = now + interval，否则回到 inactive。
//! 重新配置可发生在任何状态，立即覆盖待定的截止时间。remaining_seconds 每次读取时重新计算。

pub mod directive;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventHub;
use crate::memory::{HistoryError, JsonFile};

pub use directive::{parse_directive, Directive};

/// 对外快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub active: bool,
    /// RFC 3339
    pub deadline: Option<String>,
    /// None / 0 表示单次
    pub interval_minutes: Option<f64>,
    /// max(0, deadline − now)；未激活时为 None
    pub remaining_seconds: Option<f64>,
}

impl SchedulerState {
    pub fn inactive() -> Self {
        Self {
            active: false,
            deadline: None,
            interval_minutes: None,
            remaining_seconds: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Plan {
    deadline: Option<DateTime<Utc>>,
    interval_minutes: Option<f64>,
}

impl Plan {
    fn recurring_interval(&self) -> Option<Duration> {
        self.interval_minutes.and_then(minutes)
    }

    fn state_at(&self, now: DateTime<Utc>) -> SchedulerState {
        match self.deadline {
            None => SchedulerState::inactive(),
            Some(deadline) => SchedulerState {
                active: true,
                deadline: Some(deadline.to_rfc3339()),
                interval_minutes: self.interval_minutes,
                remaining_seconds: Some(((deadline - now).num_milliseconds().max(0)) as f64 / 1000.0),
            },
        }
    }
}

/// 持久化形式
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedPlan {
    deadline: Option<String>,
    interval_minutes: Option<f64>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// 分钟数 → Duration；非正数、非有限值或超过一年视为无效
fn minutes(m: f64) -> Option<Duration> {
    const MAX_MINUTES: f64 = 366.0 * 24.0 * 60.0;
    if !m.is_finite() || m <= 0.0 || m > MAX_MINUTES {
        return None;
    }
    Some(Duration::milliseconds((m * 60_000.0).round() as i64))
}

pub struct Scheduler {
    plan: tokio::sync::Mutex<Plan>,
    file: Option<JsonFile>,
    hub: Arc<EventHub>,
    /// 上一次发布的快照（去掉 remaining_seconds），用来避免重复推送
    last_published: Mutex<Option<SchedulerState>>,
}

impl Scheduler {
    pub fn in_memory(hub: Arc<EventHub>) -> Self {
        Self {
            plan: tokio::sync::Mutex::new(Plan::default()),
            file: None,
            hub,
            last_published: Mutex::new(None),
        }
    }

    /// 从状态文件恢复；已过期的循环计划顺延到 now + interval，已过期的单次计划留待第一次轮询触发
    pub async fn open(file: JsonFile, hub: Arc<EventHub>, now: DateTime<Utc>) -> Result<Self, HistoryError> {
        let persisted: PersistedPlan = file.load().await?.unwrap_or_default();
        let mut plan = Plan {
            deadline: persisted
                .deadline
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc)),
            interval_minutes: persisted.interval_minutes.filter(|m| minutes(*m).is_some()),
        };
        if let (Some(deadline), Some(interval)) = (plan.deadline, plan.recurring_interval()) {
            if deadline <= now {
                plan.deadline = Some(now + interval);
            }
        }
        tracing::info!(path = %file.path().display(), active = plan.deadline.is_some(), "scheduler state loaded");
        let scheduler = Self {
            plan: tokio::sync::Mutex::new(plan),
            file: Some(file),
            hub,
            last_published: Mutex::new(None),
        };
        scheduler.persist(&plan).await;
        Ok(scheduler)
    }

    async fn persist(&self, plan: &Plan) {
        let Some(file) = &self.file else {
            return;
        };
        let persisted = PersistedPlan {
            deadline: plan.deadline.map(|d| d.to_rfc3339()),
            interval_minutes: plan.interval_minutes,
            updated_at: Some(Utc::now().to_rfc3339()),
        };
        if let Err(e) = file.save(&persisted).await {
            tracing::warn!("failed to save scheduler state: {}", e);
        }
    }

    /// 状态变化时推送 scheduler_update（只比较 active / deadline / interval）
    fn publish_if_changed(&self, state: &SchedulerState) {
        let key = SchedulerState {
            remaining_seconds: None,
            ..state.clone()
        };
        let mut last = self.last_published.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref() == Some(&key) {
            return;
        }
        *last = Some(key);
        drop(last);
        self.hub.publish_scheduler(state.clone());
    }

    pub async fn state_at(&self, now: DateTime<Utc>) -> SchedulerState {
        self.plan.lock().await.state_at(now)
    }

    pub async fn state(&self) -> SchedulerState {
        self.state_at(Utc::now()).await
    }

    /// 重新配置：deadline = now + delay（未给出时用 interval），interval > 0 时为循环计划；两者都无效则清除
    pub async fn configure(
        &self,
        interval_minutes: Option<f64>,
        delay_minutes: Option<f64>,
        now: DateTime<Utc>,
    ) -> SchedulerState {
        let interval = interval_minutes.filter(|m| minutes(*m).is_some());
        let delay = delay_minutes.and_then(minutes).or_else(|| interval.and_then(minutes));
        let mut plan = self.plan.lock().await;
        *plan = match delay {
            Some(delay) => Plan {
                deadline: Some(now + delay),
                interval_minutes: interval,
            },
            None => Plan::default(),
        };
        self.persist(&plan).await;
        let state = plan.state_at(now);
        // 持有 plan 锁时发布，保证快照的 seq 顺序与修改顺序一致
        self.publish_if_changed(&state);
        drop(plan);
        tracing::info!(
            active = state.active,
            deadline = ?state.deadline,
            interval_minutes = ?state.interval_minutes,
            "scheduler reconfigured"
        );
        state
    }

    pub async fn clear(&self, now: DateTime<Utc>) -> SchedulerState {
        self.configure(None, None, now).await
    }

    pub async fn apply_directive(&self, directive: Directive, now: DateTime<Utc>) -> SchedulerState {
        match directive {
            Directive::FollowUp { minutes } => {
                let m = f64::from(minutes);
                self.configure(Some(m), Some(m), now).await
            }
            Directive::Complete => self.clear(now).await,
        }
    }

    pub async fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.plan.lock().await.deadline.is_some_and(|d| now >= d)
    }

    /// 到期则推进状态并返回新快照；未到期（可能刚被重新配置）返回 None。
    /// 调用方必须已持有会话锁。
    pub async fn fire(&self, now: DateTime<Utc>) -> Option<SchedulerState> {
        let mut plan = self.plan.lock().await;
        if !plan.deadline.is_some_and(|d| now >= d) {
            return None;
        }
        *plan = match plan.recurring_interval() {
            Some(interval) => Plan {
                deadline: Some(now + interval),
                interval_minutes: plan.interval_minutes,
            },
            None => Plan::default(),
        };
        self.persist(&plan).await;
        let state = plan.state_at(now);
        self.publish_if_changed(&state);
        drop(plan);
        tracing::info!(next_deadline = ?state.deadline, "scheduler fired");
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hub() -> Arc<EventHub> {
        EventHub::new(64, 16)
    }

    #[tokio::test]
    async fn test_inactive_by_default() {
        let s = Scheduler::in_memory(hub());
        let state = s.state().await;
        assert!(!state.active);
        assert_eq!(state.remaining_seconds, None);
        assert!(!s.is_due(Utc::now()).await);
    }

    #[tokio::test]
    async fn test_remaining_never_negative_and_non_increasing() {
        let s = Scheduler::in_memory(hub());
        let t0 = Utc::now();
        s.configure(Some(1.0), None, t0).await;
        let a = s.state_at(t0 + Duration::seconds(10)).await.remaining_seconds.unwrap();
        let b = s.state_at(t0 + Duration::seconds(20)).await.remaining_seconds.unwrap();
        let c = s.state_at(t0 + Duration::seconds(90)).await.remaining_seconds.unwrap();
        assert_eq!(a, 50.0);
        assert!(b <= a);
        assert_eq!(c, 0.0);
    }

    #[tokio::test]
    async fn test_recurring_fire_advances_by_interval() {
        let s = Scheduler::in_memory(hub());
        let t0 = Utc::now();
        s.configure(Some(1.0), None, t0).await;
        let fire_at = t0 + Duration::seconds(61);
        assert!(s.fire(t0 + Duration::seconds(30)).await.is_none());
        let state = s.fire(fire_at).await.unwrap();
        assert!(state.active);
        assert_eq!(state.remaining_seconds, Some(60.0));
        assert_eq!(state.deadline, Some((fire_at + Duration::seconds(60)).to_rfc3339()));
    }

    #[tokio::test]
    async fn test_one_shot_fire_deactivates() {
        let s = Scheduler::in_memory(hub());
        let t0 = Utc::now();
        s.configure(None, Some(2.0), t0).await;
        assert_eq!(s.state_at(t0).await.interval_minutes, None);
        let state = s.fire(t0 + Duration::minutes(2)).await.unwrap();
        assert!(!state.active);
        assert!(!s.is_due(t0 + Duration::minutes(10)).await);
    }

    #[tokio::test]
    async fn test_reconfigure_supersedes_pending_deadline() {
        let s = Scheduler::in_memory(hub());
        let t0 = Utc::now();
        s.configure(Some(1.0), None, t0).await;
        s.configure(Some(30.0), None, t0 + Duration::seconds(59)).await;
        assert!(!s.is_due(t0 + Duration::seconds(61)).await);
        s.configure(Some(0.0), None, t0).await;
        assert!(!s.state().await.active);
    }

    #[tokio::test]
    async fn test_directive_configures_and_clears() {
        let s = Scheduler::in_memory(hub());
        let t0 = Utc::now();
        let state = s.apply_directive(Directive::FollowUp { minutes: 15 }, t0).await;
        assert_eq!(state.interval_minutes, Some(15.0));
        assert_eq!(state.remaining_seconds, Some(900.0));
        let state = s.apply_directive(Directive::Complete, t0).await;
        assert!(!state.active);
    }

    #[tokio::test]
    async fn test_updates_published_only_on_change() {
        let hub = hub();
        let s = Scheduler::in_memory(Arc::clone(&hub));
        let t0 = Utc::now();
        s.configure(Some(5.0), None, t0).await;
        s.configure(Some(5.0), None, t0).await;
        assert_eq!(hub.drain().len(), 1);
        s.clear(t0).await;
        assert_eq!(hub.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_moves_overdue_recurring_plan_forward() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.json");
        let t0 = Utc::now();
        {
            let s = Scheduler::open(JsonFile::new(&path), hub(), t0).await.unwrap();
            s.configure(Some(10.0), None, t0).await;
        }
        let later = t0 + Duration::minutes(25);
        let s = Scheduler::open(JsonFile::new(&path), hub(), later).await.unwrap();
        assert!(!s.is_due(later).await);
        assert_eq!(s.state_at(later).await.remaining_seconds, Some(600.0));
    }

    #[tokio::test]
    async fn test_reload_keeps_overdue_one_shot_due() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler.json");
        let t0 = Utc::now();
        {
            let s = Scheduler::open(JsonFile::new(&path), hub(), t0).await.unwrap();
            s.configure(None, Some(1.0), t0).await;
        }
        let later = t0 + Duration::minutes(5);
        let s = Scheduler::open(JsonFile::new(&path), hub(), later).await.unwrap();
        assert!(s.is_due(later).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_highest_seq_snapshot_matches_final_plan() {
        use crate::events::EventKind;

        let hub = EventHub::new(1024, 16);
        let scheduler = Arc::new(Scheduler::in_memory(Arc::clone(&hub)));
        let now = Utc::now();
        let tasks: Vec<_> = (1..=64)
            .map(|i| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler.configure(Some(f64::from(i)), None, now).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let (_, latest) = hub
            .drain()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::SchedulerUpdate { scheduler } => Some((e.seq, scheduler)),
                _ => None,
            })
            .max_by_key(|(seq, _)| *seq)
            .unwrap();
        let current = scheduler.state_at(now).await;
        assert_eq!(latest.deadline, current.deadline);
        assert_eq!(latest.interval_minutes, current.interval_minutes);
    }
}
