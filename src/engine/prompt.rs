//! 提示词：系统提示词 + 当前时间信息，以及各类自动触发输入的模板渲染

use chrono::{DateTime, Local, Timelike};

use crate::config::PromptsSection;

/// 一天中的时段（按小时：< 12 上午，< 18 下午，其余晚上）
pub fn period_of(now: &DateTime<Local>) -> &'static str {
    match now.hour() {
        h if h < 12 => "morning",
        h if h < 18 => "afternoon",
        _ => "evening",
    }
}

/// 替换模板中的 `{now}` / `{weekday}` / `{period}`
pub fn render(template: &str, now: &DateTime<Local>) -> String {
    template
        .replace("{now}", &now.format("%Y-%m-%d %H:%M").to_string())
        .replace("{weekday}", &now.format("%A").to_string())
        .replace("{period}", period_of(now))
}

#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    pub nudge: String,
    pub scheduled: String,
    pub greeting: String,
}

impl PromptSet {
    /// 系统提示词优先读 system_prompt_file，读不到时退回内联的 system_prompt
    pub async fn load(cfg: &PromptsSection) -> Self {
        let mut system = cfg.system_prompt.clone();
        if let Some(path) = &cfg.system_prompt_file {
            match tokio::fs::read_to_string(path).await {
                Ok(text) if !text.trim().is_empty() => system = text,
                Ok(_) => tracing::warn!(path = %path.display(), "system prompt file is empty, using inline prompt"),
                Err(e) => tracing::warn!(path = %path.display(), "failed to read system prompt file: {}", e),
            }
        }
        Self {
            system,
            nudge: cfg.nudge.clone(),
            scheduled: cfg.scheduled.clone(),
            greeting: cfg.greeting.clone(),
        }
    }

    pub fn system_at(&self, now: &DateTime<Local>) -> String {
        format!(
            "{}\n\n[Current time]\nToday is {} {} ({}).",
            self.system.trim_end(),
            now.format("%Y-%m-%d %H:%M:%S"),
            now.format("%A"),
            period_of(now)
        )
    }
}

impl From<&PromptsSection> for PromptSet {
    fn from(cfg: &PromptsSection) -> Self {
        Self {
            system: cfg.system_prompt.clone(),
            nudge: cfg.nudge.clone(),
            scheduled: cfg.scheduled.clone(),
            greeting: cfg.greeting.clone(),
        }
    }
}
