//! OpenAI-compatible chat-completions client (non-streaming).
//!
//! Request/response DTOs follow the Chat Completions wire format so the
//! client works against any compatible gateway; only the fields the runtime
//! reads are modelled.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, Role, ToolCall};
use crate::registry::ToolSpec;

use super::{LlmClient, LlmError, LlmResponse, LlmUsage};

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
/// Environment variable overriding the endpoint base (e.g. a LiteLLM proxy).
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Chat-completions client for an OpenAI-compatible endpoint.
///
/// Reads `OPENAI_API_KEY` (required) and `OPENAI_BASE_URL` (optional) once at
/// construction; absence of the key is fatal there, not at the first call.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
}

impl OpenAiChat {
    pub fn from_env(model: impl Into<String>) -> Result<Self, LlmError> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| LlmError::Config(format!("{} not set", API_KEY_ENV)))?;
        let base_url =
            std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(base_url, api_key, model))
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn build_body(&self, messages: &[Message], tools: &[ToolSpec]) -> Value {
        let wire_messages: Vec<WireMessage<'_>> = messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                },
                content: &m.content,
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|c| WireToolCall {
                                id: c.id.clone(),
                                call_type: "function".into(),
                                function: WireFunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
        });
        if !tools.is_empty() {
            let wire_tools: Vec<WireTool<'_>> = tools
                .iter()
                .map(|t| WireTool {
                    tool_type: "function",
                    function: WireFunction {
                        name: &t.name,
                        description: t.description.as_deref(),
                        parameters: &t.input_schema,
                    },
                })
                .collect();
            body["tools"] = serde_json::to_value(wire_tools).unwrap_or(Value::Null);
            body["tool_choice"] = Value::String("auto".into());
        }
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiChat {
    async fn invoke(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(messages, tools))
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Http(format!("{}: {}", status, text)));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Response(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Response("no choices in completion".into()))?;

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
            usage: parsed.usage.map(|u| LlmUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }
}
