//! 工具层：注册表与会话内置能力

pub mod registry;
pub mod schedule;

pub use registry::{Tool, ToolRegistry};
pub use schedule::ScheduleFollowupTool;
