//! Foreman - 会话编排服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、会话锁、会话编排、优雅关闭
//! - **engine**: 生成引擎（流式输出、工具轮次、提示词）
//! - **events**: 流式事件、分发（实时流 / 补取队列 / 广播）与消费端对账
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话数据模型、历史存储与 JSON 持久化
//! - **observability**: 日志初始化
//! - **scheduler**: 定时自主唤醒与截止时间指令
//! - **server**: HTTP 接口（NDJSON / SSE）
//! - **tools**: 工具注册表与内置能力

pub mod config;
pub mod core;
pub mod engine;
pub mod events;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod scheduler;
pub mod server;
pub mod tools;

pub use crate::core::{Session, SessionError, Trigger, TurnHandle};
pub use crate::events::{EventKind, StreamEvent, TurnReconciler};
