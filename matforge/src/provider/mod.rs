//! Tool-provider connections: one transport-specific client per server that
//! speaks the JSON-RPC tool protocol (`tools/list`, `tools/call`).
//!
//! Two transports: stdio (spawn a subprocess, newline-delimited frames) and
//! HTTP with optional SSE response bodies. Connections are owned by the
//! supervisor and live on the tool loop; callers never close one directly.

mod http;
pub mod protocol;
mod stdio;
#[cfg(test)]
pub(crate) mod testutil;

pub use http::{HttpConnection, HttpServerParams};
pub use protocol::{ContentPart, RemoteTool};
pub use stdio::{StdioConnection, StdioServerParams};

use serde_json::Value;

/// Transport failures and protocol violations, surfaced as tool-call errors.
/// Protocol errors are deliberately folded in here: a provider that cannot
/// frame its responses is as unusable as one that hung up.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("transport i/o: {0}")]
    Io(String),
    #[error("provider exited: {detail}; stderr tail: {tail}")]
    ChildExited { detail: String, tail: String },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("initialize: {0}")]
    Initialize(String),
    #[error("tool failed: {0}")]
    ToolFailure(String),
    #[error("connection closed")]
    Closed,
}

/// Transport selection plus its parameters, as parsed from the server config.
#[derive(Debug, Clone)]
pub enum TransportParams {
    Stdio(StdioServerParams),
    /// `http`, `sse`, and `streamable-http` all use the HTTP client.
    Http(HttpServerParams),
}

/// A live connection to one tool provider.
pub enum ProviderConnection {
    Stdio(StdioConnection),
    Http(HttpConnection),
}

impl ProviderConnection {
    pub async fn open(params: &TransportParams) -> Result<Self, TransportError> {
        match params {
            TransportParams::Stdio(p) => StdioConnection::open(p).await.map(Self::Stdio),
            TransportParams::Http(p) => HttpConnection::open(p).await.map(Self::Http),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, TransportError> {
        match self {
            Self::Stdio(c) => c.list_tools().await,
            Self::Http(c) => c.list_tools().await,
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Vec<ContentPart>, TransportError> {
        match self {
            Self::Stdio(c) => c.call_tool(name, arguments).await,
            Self::Http(c) => c.call_tool(name, arguments).await,
        }
    }

    /// Idempotent; the supervisor fiber guarantees this runs on every exit
    /// path.
    pub async fn close(&self) {
        match self {
            Self::Stdio(c) => c.close().await,
            Self::Http(c) => c.close().await,
        }
    }
}
