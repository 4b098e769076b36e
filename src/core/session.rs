//! 会话编排：所有对外操作的入口
//!
//! 发送 / nudge / 重试 / 调度触发 / 启动问候都走同一条路径：
//! 占用会话锁 → 附着实时流（若有调用方）→ 后台任务运行生成引擎 → 释放锁 → 发出终止事件。
//! 调用方断开或超时不会取消后台任务；回合照常完成并持久化，结果经补取队列或历史读取获得。

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ErrorKind, LockGuard, SessionError, SessionLock};
use crate::config::{reload_config, AppConfig};
use crate::engine::{GenerationEngine, PromptSet, Turn, TurnMode};
use crate::events::{EventHub, LiveStream, StreamEvent, SCHEDULER_MESSAGE_ID};
use crate::llm::{create_client, LlmClient};
use crate::memory::{ChatRecord, HistoryStore, JsonFile, Role, TurnOrigin};
use crate::scheduler::{parse_directive, Scheduler, SchedulerState};
use crate::tools::{ScheduleFollowupTool, ToolRegistry};

/// 回合触发方式
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    /// 用户发送；空文本视为 nudge
    Send { text: String },
    /// 主动追问（无新输入）
    Nudge,
    /// 重新生成某条记录的尾部
    Retry { record_index: u64 },
    /// 启动时历史为空的问候
    Greeting,
}

/// 已启动的回合
pub struct TurnHandle {
    pub message_id: String,
    /// 调用方请求了实时流时存在；Drop 后剩余事件转入补取队列
    pub live: Option<LiveStream>,
    task: JoinHandle<()>,
}

impl TurnHandle {
    /// 取走实时流
    pub fn take_live(&mut self) -> Option<LiveStream> {
        self.live.take()
    }

    /// 等待后台任务结束（终止事件已发出）
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            tracing::error!(message_id = %self.message_id, "turn task failed: {}", e);
        }
    }
}

/// 会话：显式持有锁、历史、事件分发、调度器与当前引擎（无全局状态）
pub struct Session {
    config: RwLock<AppConfig>,
    config_path: Option<PathBuf>,
    history: Arc<HistoryStore>,
    lock: Arc<SessionLock>,
    hub: Arc<EventHub>,
    scheduler: Arc<Scheduler>,
    engine: RwLock<Arc<GenerationEngine>>,
}

/// 按配置组装引擎：LLM 客户端 + 内置能力 + 提示词
pub async fn build_engine(
    config: &AppConfig,
    llm: Arc<dyn LlmClient>,
    scheduler: &Arc<Scheduler>,
) -> GenerationEngine {
    let mut tools = ToolRegistry::new(Duration::from_secs(config.llm.timeouts.request));
    tools.register(ScheduleFollowupTool::new(Arc::clone(scheduler)));
    let prompts = PromptSet::load(&config.prompts).await;
    GenerationEngine::new(llm, tools, prompts).with_settings(config)
}

impl Session {
    pub fn new(
        config: AppConfig,
        history: HistoryStore,
        hub: Arc<EventHub>,
        scheduler: Arc<Scheduler>,
        engine: GenerationEngine,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            config_path: None,
            history: Arc::new(history),
            lock: SessionLock::new(),
            hub,
            scheduler,
            engine: RwLock::new(Arc::new(engine)),
        })
    }

    /// 从配置打开会话：加载历史与调度状态，按 provider 创建 LLM 客户端
    pub async fn open(config: AppConfig, config_path: Option<PathBuf>) -> Result<Arc<Self>, SessionError> {
        tokio::fs::create_dir_all(&config.app.data_dir)
            .await
            .map_err(|e| SessionError::Config(format!("cannot create data dir: {}", e)))?;
        let hub = EventHub::new(config.events.catchup_capacity, config.events.bus_capacity);
        let history = HistoryStore::open(JsonFile::new(config.app.history_file())).await?;
        let scheduler = Arc::new(
            Scheduler::open(JsonFile::new(config.scheduler_state_file()), Arc::clone(&hub), Utc::now()).await?,
        );
        let llm = create_client(&config.llm).map_err(|e| SessionError::Config(e.to_string()))?;
        let engine = build_engine(&config, llm, &scheduler).await;
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            history: Arc::new(history),
            lock: SessionLock::new(),
            hub,
            scheduler,
            engine: RwLock::new(Arc::new(engine)),
        }))
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn lock(&self) -> &Arc<SessionLock> {
        &self.lock
    }

    pub async fn config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// 启动一个回合；锁被占用时返回 Busy，不排队
    ///
    /// message_id 由调用方提供时不得为保留的 "scheduler"。每个回合的 seq 都从 0 开始，
    /// 因此复用已结束回合的 message_id 会让同一消费端（TurnReconciler）把新回合的事件当作重复而丢弃；
    /// 调用方应为每个回合使用新的 id（省略时自动生成 UUID）。
    pub async fn start_turn(
        &self,
        trigger: Trigger,
        message_id: Option<String>,
        attach_live: bool,
    ) -> Result<TurnHandle, SessionError> {
        let message_id = message_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if message_id == SCHEDULER_MESSAGE_ID {
            return Err(SessionError::ReservedMessageId { message_id });
        }
        let guard = self.lock.try_acquire(&message_id)?;
        let engine = Arc::clone(&*self.engine.read().await);

        let turn = match trigger {
            Trigger::Send { text } if !text.trim().is_empty() => Turn {
                mode: TurnMode::Append,
                origin: TurnOrigin::User,
                input: text,
            },
            Trigger::Send { .. } | Trigger::Nudge => Turn {
                mode: TurnMode::Append,
                origin: TurnOrigin::Nudge,
                input: engine.trigger_input(TurnOrigin::Nudge),
            },
            Trigger::Greeting => Turn {
                mode: TurnMode::Append,
                origin: TurnOrigin::Greeting,
                input: engine.trigger_input(TurnOrigin::Greeting),
            },
            Trigger::Retry { record_index } => {
                // guard 在此返回时 Drop，锁随之释放
                let record = self
                    .history
                    .get(record_index)
                    .await
                    .ok_or(SessionError::RecordNotFound { record_index })?;
                Turn {
                    mode: TurnMode::Regenerate { record_index },
                    origin: record.origin,
                    input: String::new(),
                }
            }
        };

        let live = attach_live.then(|| self.hub.attach_live(&message_id));
        Ok(self.spawn_turn(guard, engine, turn, live))
    }

    fn spawn_turn(
        &self,
        guard: LockGuard,
        engine: Arc<GenerationEngine>,
        turn: Turn,
        live: Option<LiveStream>,
    ) -> TurnHandle {
        let message_id = guard.message_id().to_string();
        let history = Arc::clone(&self.history);
        let hub = Arc::clone(&self.hub);
        let scheduler = Arc::clone(&self.scheduler);
        tracing::info!(message_id = %message_id, mode = ?turn.mode, origin = ?turn.origin, "turn started");

        let task_id = message_id.clone();
        let task = tokio::spawn(async move {
            let mut publisher = hub.publisher(&task_id);
            let result = AssertUnwindSafe(engine.run(&turn, &history, &mut publisher))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(outcome)) => {
                    if let Some(directive) = parse_directive(&outcome.response) {
                        tracing::info!(message_id = %task_id, ?directive, "deadline directive in reply");
                        scheduler.apply_directive(directive, Utc::now()).await;
                    }
                    guard.release();
                    publisher.done(outcome.record_index, Some(outcome.response.clone()), outcome.replaced);
                    tracing::info!(
                        message_id = %task_id,
                        record_index = outcome.record_index,
                        replaced = outcome.replaced,
                        "turn finished"
                    );
                    if turn.origin == TurnOrigin::Scheduled && turn.mode == TurnMode::Append {
                        publisher.auto_followup(outcome.response);
                    }
                }
                Ok(Err(failure)) => {
                    guard.release();
                    tracing::warn!(message_id = %task_id, kind = ?failure.kind, "turn failed: {}", failure.message);
                    publisher.error(failure.kind, failure.message);
                }
                Err(_) => {
                    guard.release();
                    tracing::error!(message_id = %task_id, "generation panicked");
                    publisher.error(ErrorKind::Generation, "generation panicked");
                }
            }
        });

        TurnHandle {
            message_id,
            live,
            task,
        }
    }

    pub async fn history(&self) -> Vec<ChatRecord> {
        self.history.list().await
    }

    /// 编辑单条消息内容；不需要会话锁，与其它写入在存储内串行
    pub async fn edit(
        &self,
        record_index: u64,
        message_index: usize,
        role: Option<Role>,
        content: String,
    ) -> Result<(), SessionError> {
        self.history.edit(record_index, message_index, role, content).await?;
        tracing::info!(record_index, message_index, "message edited");
        Ok(())
    }

    /// 清空历史，同时清除调度计划与补取队列
    pub async fn clear(&self) -> Result<(), SessionError> {
        self.history.clear().await?;
        self.hub.clear_catchup();
        self.scheduler.clear(Utc::now()).await;
        tracing::info!("history cleared");
        Ok(())
    }

    /// 取走补取队列（包括未被实时流观察到的 scheduler_update）
    pub fn poll(&self) -> Vec<StreamEvent> {
        self.hub.drain()
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state().await
    }

    pub async fn configure_scheduler(
        &self,
        interval_minutes: Option<f64>,
        delay_minutes: Option<f64>,
    ) -> SchedulerState {
        self.scheduler.configure(interval_minutes, delay_minutes, Utc::now()).await
    }

    pub async fn clear_scheduler(&self) -> SchedulerState {
        self.scheduler.clear(Utc::now()).await
    }

    /// 一次调度检查：到期且锁空闲时触发自主回合；锁被占用则留到下一次
    pub async fn scheduler_tick(&self, now: DateTime<Utc>) -> Option<TurnHandle> {
        if !self.scheduler.is_due(now).await {
            return None;
        }
        let message_id = format!("auto-{}", uuid::Uuid::new_v4());
        let guard = match self.lock.try_acquire(&message_id) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::debug!("scheduler fire deferred: {}", e);
                return None;
            }
        };
        // 在持锁状态下复核：期间可能已被重新配置
        self.scheduler.fire(now).await?;
        let engine = Arc::clone(&*self.engine.read().await);
        let turn = Turn {
            mode: TurnMode::Append,
            origin: TurnOrigin::Scheduled,
            input: engine.trigger_input(TurnOrigin::Scheduled),
        };
        Some(self.spawn_turn(guard, engine, turn, None))
    }

    /// 调度轮询循环，直到 token 取消
    pub async fn run_scheduler(self: Arc<Self>, token: CancellationToken) {
        let tick = Duration::from_millis(self.config.read().await.scheduler.tick_millis.max(10));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(tick_millis = tick.as_millis() as u64, "scheduler loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let _ = self.scheduler_tick(Utc::now()).await;
                }
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    /// 启动问候：开启 greet_on_empty 且历史为空时触发一次
    pub async fn greet_if_empty(&self) -> Result<Option<TurnHandle>, SessionError> {
        if !self.config.read().await.app.greet_on_empty || !self.history.is_empty().await {
            return Ok(None);
        }
        tracing::info!("history is empty, sending greeting");
        self.start_turn(Trigger::Greeting, None, false).await.map(Some)
    }

    /// 重新加载配置并替换引擎；进行中的回合继续持有旧引擎
    pub async fn reload_config(&self) -> Result<(), SessionError> {
        let config = reload_config(self.config_path.clone()).map_err(|e| SessionError::Config(e.to_string()))?;
        let llm = create_client(&config.llm).map_err(|e| SessionError::Config(e.to_string()))?;
        let engine = build_engine(&config, llm, &self.scheduler).await;
        *self.engine.write().await = Arc::new(engine);
        tracing::info!(provider = %config.llm.provider, model = %config.llm.model, "config reloaded");
        *self.config.write().await = config;
        Ok(())
    }
}
