//! LLM client abstraction for the agent turn loop.
//!
//! The runtime treats the language model as a black box: messages in,
//! assistant text plus optional tool calls out. `MockLlm` scripts turns for
//! tests; `OpenAiChat` talks to any OpenAI-compatible chat-completions
//! endpoint.

mod mock;
mod openai;

pub use mock::MockLlm;
pub use openai::OpenAiChat;

use async_trait::async_trait;

use crate::message::{Message, ToolCall};
use crate::registry::ToolSpec;

/// Token usage for one LLM call, when the provider reports it.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response from one LLM completion: assistant text and optional tool calls.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    pub content: String,
    /// Tool calls for this turn; empty means a plain assistant message.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<LlmUsage>,
}

/// Errors from LLM completion calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm http: {0}")]
    Http(String),
    #[error("llm response: {0}")]
    Response(String),
    #[error("llm not configured: {0}")]
    Config(String),
}

/// LLM client: given dialog messages and the available tool specs, returns
/// assistant text and any tool invocations.
///
/// Implementations must be cheap to share (`Arc<dyn LlmClient>`); the agent
/// submits `invoke` futures onto the tool loop, so they must be `Send`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError>;
}
