//! LLM 层：后端抽象与实现（OpenAI 兼容 / Anthropic / 脚本化）

pub mod anthropic;
pub mod openai;
pub mod retry;
pub mod scripted;
pub mod traits;
pub mod types;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use retry::RetryPolicy;
pub use scripted::{ScriptLog, ScriptStep, ScriptedAdapter, ScriptedReply};
pub use traits::ProviderAdapter;
pub use types::{
    new_call_id, ProviderCapabilities, ProviderInfo, ProviderInput, ProviderPayload, Response,
    ResponseChunk, ResponseStream, ToolCall, ToolResult,
};

use crate::config::LlmConfig;
use crate::core::ConfigurationError;

/// 按配置创建后端；除 ollama / scripted 外缺少 API key 视为配置错误
pub fn create_adapter(config: &LlmConfig) -> Result<Box<dyn ProviderAdapter>, ConfigurationError> {
    let provider = config.provider.to_lowercase();
    if !matches!(
        provider.as_str(),
        "openai" | "deepseek" | "ollama" | "anthropic" | "claude" | "scripted"
    ) {
        return Err(ConfigurationError::UnknownProvider(provider));
    }
    let needs_key = !matches!(provider.as_str(), "ollama" | "scripted");
    if needs_key && config.api_key.as_deref().map_or(true, str::is_empty) {
        return Err(ConfigurationError::MissingApiKey {
            provider: provider.clone(),
            env_var: config
                .api_key_env_var()
                .unwrap_or("OPENAI_API_KEY")
                .to_string(),
        });
    }

    let adapter: Box<dyn ProviderAdapter> = match provider.as_str() {
        "openai" | "deepseek" | "ollama" => Box::new(OpenAiAdapter::new(config)?),
        "anthropic" | "claude" => Box::new(AnthropicAdapter::new(config)?),
        "scripted" => Box::new(ScriptedAdapter::new(config.model.clone())),
        other => return Err(ConfigurationError::UnknownProvider(other.to_string())),
    };
    tracing::info!(provider = %provider, model = %config.model, "provider adapter created");
    Ok(adapter)
}
