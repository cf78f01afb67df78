//! HTTP transport: POST one JSON-RPC message per request to a long-lived
//! endpoint; responses arrive as plain JSON or as an SSE body.
//!
//! Covers the `http`, `sse`, and `streamable-http` transport names from the
//! server config; they share this client, which accepts both response
//! encodings on every call. A session id returned by the server on
//! initialize is echoed on subsequent requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use super::protocol::{
    parse_call_result, parse_list_tools, request_id, ContentPart, RemoteTool, RpcNotification,
    RpcRequest, RpcResponse, INITIALIZE_REQUEST_ID, PROTOCOL_VERSION,
};
use super::TransportError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection parameters for a remote provider.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HttpServerParams {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Parses a JSON-RPC response out of an HTTP body, which is either a single
/// JSON object or an SSE stream whose `data:` lines carry JSON-RPC messages.
/// The first message with a result or error wins.
fn parse_body(body: &str, content_type: Option<&str>) -> Result<RpcResponse, TransportError> {
    let is_sse = content_type
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);
    if !is_sse {
        return serde_json::from_str(body)
            .map_err(|e| TransportError::Protocol(format!("response json: {}", e)));
    }

    let mut buffer = String::new();
    let try_flush = |buffer: &mut String| -> Option<RpcResponse> {
        if buffer.is_empty() {
            return None;
        }
        if let Ok(resp) = serde_json::from_str::<RpcResponse>(buffer) {
            if resp.result.is_some() || resp.error.is_some() {
                return Some(resp);
            }
        }
        None
    };
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            if data == "[DONE]" || data.is_empty() {
                if let Some(r) = try_flush(&mut buffer) {
                    return Ok(r);
                }
                buffer.clear();
                continue;
            }
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(data);
            if let Some(r) = try_flush(&mut buffer) {
                return Ok(r);
            }
        } else if line.trim().is_empty() {
            if let Some(r) = try_flush(&mut buffer) {
                return Ok(r);
            }
            buffer.clear();
        }
    }
    if let Some(r) = try_flush(&mut buffer) {
        return Ok(r);
    }
    Err(TransportError::Protocol(
        "SSE stream carried no JSON-RPC response".into(),
    ))
}

/// One HTTP provider connection.
#[derive(Debug)]
pub struct HttpConnection {
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
}

impl HttpConnection {
    /// Builds the client and completes the initialize handshake.
    pub async fn open(params: &HttpServerParams) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let conn = Self {
            client,
            url: params.url.clone(),
            headers: params.headers.clone().into_iter().collect(),
            session_id: Mutex::new(None),
        };
        conn.initialize().await?;
        Ok(conn)
    }

    fn post(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .body(body);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Ok(guard) = self.session_id.lock() {
            if let Some(sid) = guard.as_deref() {
                req = req.header("MCP-Session-Id", sid);
            }
        }
        req
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "matforge", "version": env!("CARGO_PKG_VERSION") }
        });
        let request = RpcRequest::new(INITIALIZE_REQUEST_ID, "initialize", params);
        let body = serde_json::to_vec(&request).map_err(|e| TransportError::Io(e.to_string()))?;
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = resp.status();
        if let Some(sid) = resp
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap() = Some(sid.to_string());
        }
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Initialize(format!(
                "initialize HTTP {}: {}",
                status,
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        parse_body(&text, content_type.as_deref())
            .map_err(|e| TransportError::Initialize(e.to_string()))?
            .into_result()
            .map_err(|e| TransportError::Initialize(e.to_string()))?;

        let notification = RpcNotification::new("notifications/initialized", json!({}));
        let body =
            serde_json::to_vec(&notification).map_err(|e| TransportError::Io(e.to_string()))?;
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let status = resp.status();
        if status != reqwest::StatusCode::ACCEPTED && !status.is_success() {
            return Err(TransportError::Initialize(format!(
                "notifications/initialized HTTP {}",
                status
            )));
        }
        Ok(())
    }

    async fn request(
        &self,
        id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let request = RpcRequest::new(id, method, params);
        let body = serde_json::to_vec(&request).map_err(|e| TransportError::Io(e.to_string()))?;
        let resp = self
            .post(body)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Io(format!(
                "{} HTTP {}: {}",
                method,
                status,
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        parse_body(&text, content_type.as_deref())?.into_result()
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, TransportError> {
        let id = request_id("tools/list", None);
        let result = self.request(&id, "tools/list", json!({})).await?;
        parse_list_tools(result)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Vec<ContentPart>, TransportError> {
        let id = request_id("tools/call", Some(name));
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(&id, "tools/call", params).await?;
        parse_call_result(result)
    }

    /// No socket to tear down; the session id is cleared so a stray handle
    /// cannot keep impersonating the session.
    pub async fn close(&self) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = None;
        }
    }
}
