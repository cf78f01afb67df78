//! JSON-RPC wire types and result parsing for the tool-provider protocol.
//!
//! Two methods matter to the runtime: `tools/list` returning descriptors with
//! a JSON-Schema `input_schema`, and `tools/call` returning a content array.
//! Malformed responses are protocol errors, surfaced as transport failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportError;

/// Protocol version sent in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2025-11-25";
/// Request id for initialize.
pub const INITIALIZE_REQUEST_ID: &str = "matforge-initialize";

/// Deterministic request id per method; tool calls embed the tool name.
/// Connections run at most one RPC in flight, so ids never collide.
pub fn request_id(method: &str, tool: Option<&str>) -> String {
    match (method, tool) {
        ("initialize", _) => INITIALIZE_REQUEST_ID.to_string(),
        ("tools/list", _) => "matforge-tools-list".to_string(),
        ("tools/call", Some(name)) => format!("matforge-call-{}", name),
        (other, _) => format!("matforge-{}", other.replace('/', "-")),
    }
}

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a str,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: &'a str, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RpcNotification<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Response frame: `id` plus `result` or `error`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    /// Extracts the result, mapping a JSON-RPC error to `TransportError::Rpc`.
    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(err) = self.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }

    pub fn id_matches(&self, expected: &str) -> bool {
        matches!(&self.id, Some(Value::String(s)) if s == expected)
    }
}

/// One frame read from a provider: a response to us, a server-initiated
/// request, or a notification.
#[derive(Debug)]
pub enum IncomingFrame {
    Response(RpcResponse),
    Request { id: Value, method: String },
    Notification { method: String },
}

/// Classifies one newline-delimited frame. Unparseable lines are protocol
/// errors so the reader can report rather than hang.
pub fn classify_frame(line: &str) -> Result<IncomingFrame, TransportError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| TransportError::Protocol(format!("bad frame: {}", e)))?;
    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let id = value.get("id").cloned();
    match (method, id) {
        (Some(method), Some(id)) => Ok(IncomingFrame::Request { id, method }),
        (Some(method), None) => Ok(IncomingFrame::Notification { method }),
        (None, _) => serde_json::from_value(value)
            .map(IncomingFrame::Response)
            .map_err(|e| TransportError::Protocol(format!("bad response frame: {}", e))),
    }
}

/// Descriptor of one remote tool from `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema object with `properties`; providers spell the key either way.
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

/// Parses a `tools/list` result into remote tool descriptors.
pub fn parse_list_tools(result: Value) -> Result<Vec<RemoteTool>, TransportError> {
    let tools = result
        .get("tools")
        .ok_or_else(|| TransportError::Protocol("no tools in tools/list response".into()))?;
    let entries = tools
        .as_array()
        .ok_or_else(|| TransportError::Protocol("tools is not an array".into()))?;
    entries
        .iter()
        .map(|entry| {
            serde_json::from_value::<RemoteTool>(entry.clone())
                .map_err(|e| TransportError::Protocol(format!("bad tool descriptor: {}", e)))
        })
        .collect()
}

/// One typed part of a `tools/call` content array.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Structured payload: a bare JSON object in the content array, or the
    /// `structuredContent` fallback.
    Json(Value),
    Image { mime_type: String, data: String },
    /// Bare string entry (some providers skip the typed wrapper).
    Raw(String),
}

impl ContentPart {
    /// Renders this part for a single observation string; formatting the
    /// whole result is the registry adapter's job.
    pub fn render(&self) -> String {
        match self {
            ContentPart::Text(t) => t.clone(),
            ContentPart::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ContentPart::Image { mime_type, .. } => format!("[image: {}]", mime_type),
            ContentPart::Raw(s) => s.clone(),
        }
    }
}

/// Parses a `tools/call` result into content parts.
///
/// An `isError: true` result becomes a transport failure carrying the first
/// text part as the message. When the content array is absent or empty, the
/// `structuredContent` field is the fallback.
pub fn parse_call_result(result: Value) -> Result<Vec<ContentPart>, TransportError> {
    if result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let message = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|p| p.get("text").and_then(|t| t.as_str()))
            .unwrap_or("tool returned error")
            .to_string();
        return Err(TransportError::ToolFailure(message));
    }

    let mut parts = Vec::new();
    if let Some(content) = result.get("content").and_then(|c| c.as_array()) {
        for entry in content {
            match entry {
                Value::String(s) => parts.push(ContentPart::Raw(s.clone())),
                Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        let text = obj.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        parts.push(ContentPart::Text(text.to_string()));
                    }
                    Some("image") => parts.push(ContentPart::Image {
                        mime_type: obj
                            .get("mimeType")
                            .and_then(|m| m.as_str())
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        data: obj
                            .get("data")
                            .and_then(|d| d.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }),
                    _ => parts.push(ContentPart::Json(entry.clone())),
                },
                other => parts.push(ContentPart::Json(other.clone())),
            }
        }
    }
    if parts.is_empty() {
        if let Some(structured) = result.get("structuredContent") {
            parts.push(ContentPart::Json(structured.clone()));
        }
    }
    if parts.is_empty() {
        return Err(TransportError::Protocol(
            "no content or structuredContent in tools/call response".into(),
        ));
    }
    Ok(parts)
}
