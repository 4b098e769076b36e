//! 生成引擎：把一个回合驱动到完成
//!
//! 组装上下文 → 调用 LLM（流式 chunk / 非流式 replace）→ 若有工具调用则执行并上报 tool 事件，进入下一轮 →
//! 无工具调用时结束，把完整回合写入历史（新增或替换尾部）。
//! 引擎只发出非终止事件；终止事件（done / error）由会话在释放锁之后发出。

pub mod prompt;

use std::sync::Arc;

use chrono::Local;
use futures_util::StreamExt;

use crate::config::AppConfig;
use crate::core::{classify, ErrorKind};
use crate::events::TurnPublisher;
use crate::llm::{ChatRequest, LlmClient, LlmDelta};
use crate::memory::{HistoryStore, Message, ToolCall, TurnOrigin};
use crate::tools::ToolRegistry;

pub use prompt::{period_of, render, PromptSet};

/// 回合写入方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnMode {
    /// 新增一条记录
    Append,
    /// 重试：替换该记录开头 user 消息之后的尾部
    Regenerate { record_index: u64 },
}

/// 一个待执行的回合
#[derive(Clone, Debug)]
pub struct Turn {
    pub mode: TurnMode,
    pub origin: TurnOrigin,
    /// 新增模式下作为 user 消息写入的文本；重试模式忽略
    pub input: String,
}

/// 成功完成（已写入历史）
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub record_index: u64,
    pub response: String,
    pub replaced: bool,
}

/// 回合失败：不提交任何记录
#[derive(Clone, Debug, PartialEq)]
pub struct TurnFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TurnFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub struct GenerationEngine {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    prompts: PromptSet,
    stream: bool,
    max_tool_rounds: usize,
}

impl GenerationEngine {
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry, prompts: PromptSet) -> Self {
        Self {
            llm,
            tools,
            prompts,
            stream: true,
            max_tool_rounds: 8,
        }
    }

    pub fn with_settings(mut self, cfg: &AppConfig) -> Self {
        self.stream = cfg.llm.stream;
        self.max_tool_rounds = cfg.llm.max_tool_rounds;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    /// 自动触发回合的输入文本（按当前本地时间渲染模板）
    pub fn trigger_input(&self, origin: TurnOrigin) -> String {
        let now = Local::now();
        let template = match origin {
            TurnOrigin::Nudge => &self.prompts.nudge,
            TurnOrigin::Scheduled => &self.prompts.scheduled,
            TurnOrigin::Greeting => &self.prompts.greeting,
            TurnOrigin::User => return String::new(),
        };
        render(template, &now)
    }

    /// 执行一个回合；成功时记录已写入历史
    pub async fn run(
        &self,
        turn: &Turn,
        history: &HistoryStore,
        publisher: &mut TurnPublisher,
    ) -> Result<TurnOutcome, TurnFailure> {
        let (mut context, head) = match turn.mode {
            TurnMode::Append => {
                let prior = history.list().await;
                let head = vec![Message::user(turn.input.clone())];
                (flatten(prior), head)
            }
            TurnMode::Regenerate { record_index } => {
                let (prior, target) = history
                    .split_at(record_index)
                    .await
                    .map_err(|e| TurnFailure::new(e.kind(), e.to_string()))?;
                let head = target.messages[..target.head_len()].to_vec();
                (flatten(prior), head)
            }
        };
        context.extend(head.iter().cloned());

        let tail = self.generate(context, publisher).await?;
        let response: String = tail
            .iter()
            .filter(|m| m.role == crate::memory::Role::Assistant)
            .map(|m| m.content.as_str())
            .collect();

        let persisted = match turn.mode {
            TurnMode::Append => {
                let mut messages = head;
                messages.extend(tail);
                history.append(turn.origin, messages).await.map(|i| (i, false))
            }
            TurnMode::Regenerate { record_index } => history
                .replace_tail(record_index, tail)
                .await
                .map(|_| (record_index, true)),
        };
        let (record_index, replaced) = persisted.map_err(|e| {
            tracing::warn!(message_id = %publisher.message_id(), "turn not committed: {}", e);
            TurnFailure::new(e.kind(), e.to_string())
        })?;

        Ok(TurnOutcome {
            record_index,
            response,
            replaced,
        })
    }

    /// 生成回合尾部（assistant / tool 消息），过程中发出 chunk / replace / tool 事件
    async fn generate(
        &self,
        context: Vec<Message>,
        publisher: &mut TurnPublisher,
    ) -> Result<Vec<Message>, TurnFailure> {
        let system = self.prompts.system_at(&Local::now());
        let specs = self.tools.to_specs();
        let mut tail: Vec<Message> = Vec::new();
        let mut so_far = String::new();

        for round in 0..=self.max_tool_rounds {
            let last_round = round == self.max_tool_rounds;
            let mut messages = context.clone();
            messages.extend(tail.iter().cloned());
            let request = ChatRequest {
                system: system.clone(),
                messages,
                tools: if last_round { Vec::new() } else { specs.clone() },
            };

            let (text, calls) = if self.stream {
                self.stream_round(&request, publisher).await?
            } else {
                let completion = self.llm.complete(&request).await.map_err(llm_failure)?;
                so_far.push_str(&completion.text);
                publisher.replace(so_far.clone());
                (completion.text, completion.tool_calls)
            };

            if calls.is_empty() {
                tail.push(Message::assistant(text));
                return Ok(tail);
            }
            if last_round {
                return Err(TurnFailure::new(
                    ErrorKind::Generation,
                    format!("tool round limit ({}) exceeded", self.max_tool_rounds),
                ));
            }

            tail.push(Message::assistant_with_tools(text, calls.clone()));
            for call in calls {
                let result = self.invoke(&call).await?;
                publisher.tool(&call.id, &call.name, &call.arguments, &result);
                tail.push(Message::tool(call.id, result));
            }
        }
        Err(TurnFailure::new(ErrorKind::Generation, "tool loop ended without a reply"))
    }

    async fn stream_round(
        &self,
        request: &ChatRequest,
        publisher: &mut TurnPublisher,
    ) -> Result<(String, Vec<ToolCall>), TurnFailure> {
        let mut stream = self.llm.complete_stream(request).await.map_err(llm_failure)?;
        let mut text = String::new();
        let mut calls = Vec::new();
        while let Some(delta) = stream.next().await {
            match delta.map_err(llm_failure)? {
                LlmDelta::Text(t) => {
                    publisher.chunk(t.clone());
                    text.push_str(&t);
                }
                LlmDelta::ToolCalls(c) => calls.extend(c),
            }
        }
        Ok((text, calls))
    }

    async fn invoke(&self, call: &ToolCall) -> Result<String, TurnFailure> {
        self.tools.execute(&call.name, &call.arguments).await.map_err(|e| {
            TurnFailure::new(classify(None, &e), format!("tool {} failed: {}", call.name, e))
        })
    }
}

fn llm_failure(e: crate::llm::LlmError) -> TurnFailure {
    TurnFailure::new(e.kind(), e.to_string())
}

fn flatten(records: Vec<crate::memory::ChatRecord>) -> Vec<Message> {
    records.into_iter().flat_map(|r| r.messages).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHub, EventKind};
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::Role;
    use crate::tools::ScheduleFollowupTool;
    use crate::scheduler::Scheduler;

    fn prompts() -> PromptSet {
        PromptSet::from(&crate::config::PromptsSection::default())
    }

    fn engine(mock: MockLlmClient) -> GenerationEngine {
        GenerationEngine::new(Arc::new(mock), ToolRegistry::default(), prompts())
    }

    fn user_turn(text: &str) -> Turn {
        Turn {
            mode: TurnMode::Append,
            origin: TurnOrigin::User,
            input: text.into(),
        }
    }

    #[tokio::test]
    async fn test_streaming_turn_appends_and_chunks_match_response() {
        let hub = EventHub::new(64, 16);
        let history = HistoryStore::in_memory();
        let engine = engine(MockLlmClient::new().reply("pong, get back to work"));
        let mut publisher = hub.publisher("m1");

        let outcome = engine.run(&user_turn("ping"), &history, &mut publisher).await.unwrap();
        assert_eq!(outcome.record_index, 0);
        assert!(!outcome.replaced);

        let chunks: String = hub
            .drain()
            .into_iter()
            .map(|e| match e.kind {
                EventKind::Chunk { content } => content,
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(chunks, outcome.response);

        let records = history.list().await;
        assert_eq!(records[0].messages[0], Message::user("ping"));
        assert_eq!(records[0].messages[1], Message::assistant("pong, get back to work"));
    }

    #[tokio::test]
    async fn test_non_streaming_uses_replace_only() {
        let hub = EventHub::new(64, 16);
        let history = HistoryStore::in_memory();
        let engine = engine(MockLlmClient::new().reply("full text")).with_stream(false);
        let mut publisher = hub.publisher("m1");
        engine.run(&user_turn("x"), &history, &mut publisher).await.unwrap();
        let kinds: Vec<&str> = hub.drain().iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["replace"]);
    }

    #[tokio::test]
    async fn test_tool_round_is_reported_and_recorded() {
        let hub = EventHub::new(64, 16);
        let history = HistoryStore::in_memory();
        let scheduler = Arc::new(Scheduler::in_memory(Arc::clone(&hub)));
        let mut tools = ToolRegistry::default();
        tools.register(ScheduleFollowupTool::new(Arc::clone(&scheduler)));
        let mock = MockLlmClient::new()
            .reply_with_tools(
                "Noted.",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "schedule_followup".into(),
                    arguments: r#"{"minutes": 30}"#.into(),
                }],
            )
            .reply(" I'll check in 30 minutes.");
        let engine = GenerationEngine::new(Arc::new(mock), tools, prompts());
        let mut publisher = hub.publisher("m1");

        let outcome = engine
            .run(&user_turn("writing the draft"), &history, &mut publisher)
            .await
            .unwrap();
        assert_eq!(outcome.response, "Noted. I'll check in 30 minutes.");

        let record = history.get(0).await.unwrap();
        let roles: Vec<Role> = record.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(record.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(scheduler.state().await.active);

        let tool_events: Vec<_> = hub
            .drain()
            .into_iter()
            .filter(|e| e.message_id == "m1" && e.kind.name() == "tool")
            .collect();
        assert_eq!(tool_events.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_commits_nothing() {
        let hub = EventHub::new(64, 16);
        let history = HistoryStore::in_memory();
        let engine = engine(MockLlmClient::new().fail(LlmError::Timeout("read timed out".into())));
        let mut publisher = hub.publisher("m1");
        let failure = engine.run(&user_turn("x"), &history, &mut publisher).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert!(history.is_empty().await);
        assert!(!publisher.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_generation_fault() {
        let hub = EventHub::new(64, 16);
        let history = HistoryStore::in_memory();
        let engine = engine(MockLlmClient::new().reply_with_tools(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "launch_rockets".into(),
                arguments: "{}".into(),
            }],
        ));
        let mut publisher = hub.publisher("m1");
        let failure = engine.run(&user_turn("x"), &history, &mut publisher).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Generation);
        assert!(history.is_empty().await);
    }

    #[tokio::test]
    async fn test_regenerate_replaces_tail_from_leading_user_message() {
        let hub = EventHub::new(64, 16);
        let history = HistoryStore::in_memory();
        history
            .append(TurnOrigin::User, vec![Message::user("ping"), Message::assistant("pong")])
            .await
            .unwrap();
        let mock = Arc::new(MockLlmClient::new().reply("pong again"));
        let engine = GenerationEngine::new(mock.clone(), ToolRegistry::default(), prompts());
        let mut publisher = hub.publisher("r1");
        let turn = Turn {
            mode: TurnMode::Regenerate { record_index: 0 },
            origin: TurnOrigin::User,
            input: String::new(),
        };
        let outcome = engine.run(&turn, &history, &mut publisher).await.unwrap();
        assert!(outcome.replaced);
        assert_eq!(history.len().await, 1);
        assert_eq!(
            history.get(0).await.unwrap().messages,
            vec![Message::user("ping"), Message::assistant("pong again")]
        );
        // 重试上下文截止到该记录的 user 消息
        assert_eq!(mock.requests()[0].messages, vec![Message::user("ping")]);
    }
}
