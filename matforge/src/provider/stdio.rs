//! Stdio transport: spawn the provider as a child process and speak
//! newline-delimited JSON-RPC frames over its stdin/stdout.
//!
//! A reader task demultiplexes responses by request id into oneshot channels
//! and answers server-initiated `roots/list` with empty roots. Stderr is
//! drained into a bounded tail kept for diagnostics. The child is spawned
//! with `kill_on_drop` so an abandoned connection cannot leak the process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use super::protocol::{
    classify_frame, parse_call_result, parse_list_tools, request_id, ContentPart, IncomingFrame,
    RemoteTool, RpcNotification, RpcRequest, RpcResponse, INITIALIZE_REQUEST_ID, PROTOCOL_VERSION,
};
use super::TransportError;

/// Initialize handshake deadline; a provider that cannot answer this quickly
/// is not going to serve tools either.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);
/// Lines of child stderr retained for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Spawn parameters for a stdio provider.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StdioServerParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// One stdio provider connection.
#[derive(Debug)]
pub struct StdioConnection {
    child: Mutex<Option<Child>>,
    writer: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    reader_alive: Arc<AtomicBool>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    /// One in-flight RPC per connection; the protocol has no multiplexing
    /// guarantee, so requests are serialized here.
    rpc_gate: Mutex<()>,
    closed: AtomicBool,
}

impl StdioConnection {
    /// Spawns the provider and completes the initialize handshake.
    pub async fn open(params: &StdioServerParams) -> Result<Self, TransportError> {
        let mut child = Command::new(&params.command)
            .args(&params.args)
            .envs(&params.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", params.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Spawn("child stderr not captured".into()))?;

        let writer = Arc::new(Mutex::new(stdin));
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let reader_alive = Arc::new(AtomicBool::new(true));
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::new()));

        tokio::spawn(read_frames(
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&reader_alive),
            Arc::clone(&writer),
        ));
        tokio::spawn(drain_stderr(
            BufReader::new(stderr),
            Arc::clone(&stderr_tail),
        ));

        let conn = Self {
            child: Mutex::new(Some(child)),
            writer,
            pending,
            reader_alive,
            stderr_tail,
            rpc_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        conn.initialize().await?;
        Ok(conn)
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "matforge", "version": env!("CARGO_PKG_VERSION") }
        });
        tokio::time::timeout(
            INITIALIZE_TIMEOUT,
            self.request(INITIALIZE_REQUEST_ID.to_string(), "initialize", params),
        )
        .await
        .map_err(|_| TransportError::Initialize("timeout waiting for initialize".into()))?
        .map_err(|e| TransportError::Initialize(e.to_string()))?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&RpcNotification::new(method, params))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.write_line(&frame).await
    }

    async fn write_line(&self, frame: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| self.exited(e.to_string()))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| self.exited(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| self.exited(e.to_string()))
    }

    async fn request(
        &self,
        id: String,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let _gate = self.rpc_gate.lock().await;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);
        // Insert-then-check: a reader that died before the insert never gets
        // to clear this entry, so it must be failed here.
        if !self.reader_alive.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().remove(&id);
            return Err(self.exited("provider stdout closed".into()));
        }

        let frame = serde_json::to_string(&RpcRequest::new(&id, method, params))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Err(e) = self.write_line(&frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(response) => response.into_result(),
            // Sender dropped: the reader hit EOF, i.e. the child is gone.
            Err(_) => Err(self.exited("no response".into())),
        }
    }

    fn exited(&self, detail: String) -> TransportError {
        let tail = self
            .stderr_tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        TransportError::ChildExited { detail, tail }
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, TransportError> {
        let id = request_id("tools/list", None);
        let result = self.request(id, "tools/list", json!({})).await?;
        parse_list_tools(result)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Vec<ContentPart>, TransportError> {
        let id = request_id("tools/call", Some(name));
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(id, "tools/call", params).await?;
        parse_call_result(result)
    }

    /// Kills the child and reaps it. Idempotent; later RPCs fail `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Reader loop: routes responses by id, answers `roots/list`, ignores
/// notifications. Ending the loop drops all pending senders, which fails any
/// in-flight request with a child-exited error.
async fn read_frames(
    mut reader: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    writer: Arc<Mutex<ChildStdin>>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("provider stdout read failed: {}", e);
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match classify_frame(trimmed) {
            Ok(IncomingFrame::Response(resp)) => {
                let key = resp
                    .id
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if let Some(key) = key {
                    if let Some(tx) = pending.lock().unwrap().remove(&key) {
                        let _ = tx.send(resp);
                    }
                }
            }
            Ok(IncomingFrame::Request { id, method }) if method == "roots/list" => {
                let reply = json!({ "jsonrpc": "2.0", "id": id, "result": { "roots": [] } });
                let mut w = writer.lock().await;
                let _ = w.write_all(reply.to_string().as_bytes()).await;
                let _ = w.write_all(b"\n").await;
                let _ = w.flush().await;
            }
            Ok(IncomingFrame::Request { method, .. }) => {
                tracing::debug!("ignoring provider request: {}", method);
            }
            Ok(IncomingFrame::Notification { .. }) => {}
            Err(e) => {
                tracing::warn!("provider protocol error: {}", e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    pending.lock().unwrap().clear();
}

async fn drain_stderr(
    mut reader: BufReader<tokio::process::ChildStderr>,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let mut tail = tail.lock().unwrap();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.trim_end().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testutil::{fake_provider_script, sh_params};

    #[tokio::test]
    async fn open_nonexistent_command_fails_spawn() {
        let params = StdioServerParams {
            command: "_matforge_no_such_command_xyz_".into(),
            args: vec![],
            env: HashMap::new(),
        };
        let err = StdioConnection::open(&params).await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
    }

    #[tokio::test]
    async fn list_and_call_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(dir.path());
        let conn = StdioConnection::open(&sh_params(&script)).await.unwrap();

        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "a");
        assert_eq!(tools[0].description.as_deref(), Some("tool a"));

        let parts = conn.call_tool("a", json!({"x": 1})).await.unwrap();
        assert_eq!(parts, vec![ContentPart::Text("ok-a".into())]);

        let err = conn.call_tool("b", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::ToolFailure(msg) if msg == "b failed"));

        conn.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(dir.path());
        let conn = StdioConnection::open(&sh_params(&script)).await.unwrap();
        conn.close().await;
        conn.close().await;
        let err = conn.call_tool("a", json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn child_exit_fails_in_flight_request_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        // Answers initialize, prints a diagnostic to stderr, then exits.
        let script = r##"#!/bin/sh
IFS= read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":"matforge-initialize","result":{}}'
IFS= read -r line
echo 'fatal: out of cheese' >&2
exit 3
"##;
        let path = dir.path().join("dying_provider.sh");
        std::fs::write(&path, script).unwrap();

        let conn = StdioConnection::open(&sh_params(&path)).await.unwrap();
        // Give the child time to emit its diagnostic and exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = conn.list_tools().await.unwrap_err();
        match err {
            TransportError::ChildExited { tail, .. } => {
                assert!(tail.contains("out of cheese"), "tail: {}", tail)
            }
            other => panic!("expected ChildExited, got {:?}", other),
        }
    }
}
