//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{ChatRequest, Completion, DeltaStream, LlmClient, LlmDelta, LlmError, ToolSpec};

use crate::config::LlmSection;

/// 按配置创建 LLM 客户端（provider = "mock" 时使用 Mock，其余走 OpenAI 兼容端点）
pub fn create_client(cfg: &LlmSection) -> Result<Arc<dyn LlmClient>, LlmError> {
    match cfg.provider.as_str() {
        "mock" => {
            tracing::info!("LLM provider: mock");
            Ok(Arc::new(MockLlmClient::new()))
        }
        "openai" | "deepseek" | "siliconflow" => {
            let client = OpenAiClient::from_config(cfg)?;
            tracing::info!(model = %cfg.model, base_url = %cfg.base_url, "LLM provider: openai-compatible");
            Ok(Arc::new(client))
        }
        other => Err(LlmError::NotConfigured(format!("unknown provider '{}'", other))),
    }
}
