use async_trait::async_trait;

use crate::errors::DroidClawResult;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};

/// Unified LLM provider trait. All providers implement this trait.
/// New providers only need to implement this trait and register in config.toml.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider's identifier (matches config.toml key).
    fn name(&self) -> &str;

    /// Sends the ordered conversation and returns the full assistant reply.
    async fn chat(&self, messages: &[ChatMessage], cfg: &CallConfig) -> DroidClawResult<LlmResponse>;
}
