//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FOREMAN__*` 覆盖（双下划线表示嵌套，如 `FOREMAN__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub llm: LlmSection,
    pub scheduler: SchedulerSection,
    pub events: EventsSection,
    pub prompts: PromptsSection,
}

/// [app] 段：名称、数据目录、启动问候
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 历史与调度状态的存放目录
    pub data_dir: PathBuf,
    /// 历史为空时，启动后自动触发一次问候回合
    pub greet_on_empty: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "Foreman".to_string(),
            data_dir: PathBuf::from("data"),
            greet_on_empty: false,
        }
    }
}

impl AppSection {
    pub fn history_file(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }
}

/// [server] 段：监听地址与调用方超时预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// 首个事件的等待预算（秒）
    pub first_event_timeout_secs: u64,
    /// 终止事件的等待预算（秒）
    pub stream_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            first_event_timeout_secs: 60,
            stream_timeout_secs: 600,
        }
    }
}

/// [llm] 段：后端选择、模型与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    /// false 时走非流式路径（replace 事件）
    pub stream: bool,
    pub temperature: f32,
    /// 单回合内工具调用轮数上限
    pub max_tool_rounds: usize,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "deepseek-ai/DeepSeek-V3.2".to_string(),
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            api_key: None,
            stream: true,
            temperature: 0.7,
            max_tool_rounds: 8,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    pub connect: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            connect: 10,
        }
    }
}

/// [scheduler] 段：轮询间隔与状态文件
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_millis: u64,
    /// 未设置时为 <data_dir>/scheduler.json
    pub state_file: Option<PathBuf>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            state_file: None,
        }
    }
}

/// [events] 段：补取队列与广播总线容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub catchup_capacity: usize,
    pub bus_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            catchup_capacity: 512,
            bus_capacity: 256,
        }
    }
}

/// [prompts] 段：系统提示词与各类自动触发的输入模板
///
/// 模板中的 `{now}` / `{weekday}` / `{period}` 在触发时替换为当前本地时间信息。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsSection {
    pub system_prompt_file: Option<PathBuf>,
    pub system_prompt: String,
    pub nudge: String,
    pub scheduled: String,
    pub greeting: String,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            system_prompt_file: None,
            system_prompt: "You are a demanding but fair supervisor. Keep the user on track with their work plan."
                .to_string(),
            nudge: "(system: the user asked you to follow up on your own. It is {now}, {weekday} {period}. \
                    Based on the conversation so far, ask about their progress.)"
                .to_string(),
            scheduled: "(system: the scheduled follow-up deadline has been reached. It is {now}, {weekday} {period}. \
                        Check in on the task that was due and push for progress.)"
                .to_string(),
            greeting: "(system: the user just came online and there is no previous conversation. \
                       It is {now}, {weekday} {period}. Ask what they plan to work on today.)"
                .to_string(),
        }
    }
}

impl AppConfig {
    pub fn scheduler_state_file(&self) -> PathBuf {
        self.scheduler
            .state_file
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("scheduler.json"))
    }
}

/// 从 config 目录加载配置，环境变量 FOREMAN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FOREMAN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FOREMAN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（配置热更新：由 Session 决定用新配置重建引擎）
pub fn reload_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    load_config(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8765);
        assert!(cfg.llm.stream);
        assert_eq!(cfg.events.catchup_capacity, 512);
        assert_eq!(cfg.app.history_file(), PathBuf::from("data").join("history.json"));
        assert_eq!(cfg.scheduler_state_file(), PathBuf::from("data").join("scheduler.json"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[llm]\nprovider = \"mock\"\nstream = false\n\n[server]\nport = 9000\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.provider, "mock");
        assert!(!cfg.llm.stream);
        assert_eq!(cfg.server.port, 9000);
        // 未出现的键保持默认
        assert_eq!(cfg.llm.max_tool_rounds, 8);
    }
}
