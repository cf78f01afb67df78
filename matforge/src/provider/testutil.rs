//! Shared fakes for provider and supervisor tests: a shell-script stdio
//! provider and a minimal HTTP JSON-RPC server.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::protocol::{INITIALIZE_REQUEST_ID, PROTOCOL_VERSION};
use super::StdioServerParams;

/// Writes a shell fake provider answering initialize / tools/list /
/// tools/call with the runtime's deterministic request ids. Exposes tools
/// `a` (succeeds with "ok-a") and `b` (returns an isError result).
pub(crate) fn fake_provider_script(dir: &std::path::Path) -> std::path::PathBuf {
    let script = r##"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"matforge-initialize","result":{"protocolVersion":"2025-11-25"}}' ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"matforge-tools-list","result":{"tools":[{"name":"a","description":"tool a","inputSchema":{"type":"object","properties":{}}},{"name":"b","inputSchema":{"type":"object","properties":{}}}]}}' ;;
    *'"method":"tools/call"'*'"name":"a"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"matforge-call-a","result":{"content":[{"type":"text","text":"ok-a"}]}}' ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"matforge-call-b","result":{"isError":true,"content":[{"type":"text","text":"b failed"}]}}' ;;
  esac
done
"##;
    let path = dir.join("fake_provider.sh");
    std::fs::write(&path, script).unwrap();
    path
}

/// Like `fake_provider_script`, but with a single tool `slow` that sleeps
/// before answering. For deadline-isolation tests.
pub(crate) fn slow_provider_script(dir: &std::path::Path, sleep_secs: u32) -> std::path::PathBuf {
    let script = format!(
        r##"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{{"jsonrpc":"2.0","id":"matforge-initialize","result":{{"protocolVersion":"2025-11-25"}}}}' ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{{"jsonrpc":"2.0","id":"matforge-tools-list","result":{{"tools":[{{"name":"slow","inputSchema":{{"type":"object","properties":{{}}}}}}]}}}}' ;;
    *'"method":"tools/call"'*)
      sleep {}
      printf '%s\n' '{{"jsonrpc":"2.0","id":"matforge-call-slow","result":{{"content":[{{"type":"text","text":"finally"}}]}}}}' ;;
  esac
done
"##,
        sleep_secs
    );
    let path = dir.join("slow_provider.sh");
    std::fs::write(&path, script).unwrap();
    path
}

pub(crate) fn sh_params(script: &std::path::Path) -> StdioServerParams {
    StdioServerParams {
        command: "sh".into(),
        args: vec![script.to_string_lossy().into_owned()],
        env: std::collections::HashMap::new(),
    }
}

pub(crate) async fn read_http_request(stream: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let header_end = pos + 4;
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            let mut body = buf[header_end..].to_vec();
            while body.len() < content_length {
                let m = stream.read(&mut tmp).await.unwrap();
                if m == 0 {
                    break;
                }
                body.extend_from_slice(&tmp[..m]);
            }
            let body = String::from_utf8_lossy(&body[..content_length]).to_string();
            return (headers, body);
        }
    }
    (String::new(), String::new())
}

pub(crate) async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &str,
) {
    let mut resp = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
    if let Some(ct) = content_type {
        resp.push_str(&format!("Content-Type: {}\r\n", ct));
    }
    for (k, v) in extra_headers {
        resp.push_str(&format!("{}: {}\r\n", k, v));
    }
    resp.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    stream.write_all(resp.as_bytes()).await.unwrap();
}

/// Serves `n` requests of the standard fake provider dialogue over HTTP:
/// one tool `remote_a` answering "ok-remote".
pub(crate) async fn serve_fake_provider(listener: TcpListener, n: usize) {
    for _ in 0..n {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (headers, body) = read_http_request(&mut stream).await;
        let json: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        let method = json.get("method").and_then(|m| m.as_str()).unwrap_or("");
        match method {
            "initialize" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": INITIALIZE_REQUEST_ID,
                    "result": {"protocolVersion": PROTOCOL_VERSION}
                })
                .to_string();
                write_http_response(
                    &mut stream,
                    "200 OK",
                    Some("application/json"),
                    &[("MCP-Session-Id", "sess-1")],
                    &body,
                )
                .await;
            }
            "notifications/initialized" => {
                write_http_response(&mut stream, "202 Accepted", None, &[], "").await;
            }
            "tools/list" => {
                assert!(
                    headers
                        .to_ascii_lowercase()
                        .contains("mcp-session-id: sess-1"),
                    "session id not echoed: {}",
                    headers
                );
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": "matforge-tools-list",
                    "result": {"tools": [
                        {"name":"remote_a","description":"a","inputSchema":{"type":"object","properties":{}}}
                    ]}
                })
                .to_string();
                write_http_response(&mut stream, "200 OK", Some("application/json"), &[], &body)
                    .await;
            }
            "tools/call" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": "matforge-call-remote_a",
                    "result": {"content": [{"type":"text","text":"ok-remote"}]}
                })
                .to_string();
                write_http_response(&mut stream, "200 OK", Some("application/json"), &[], &body)
                    .await;
            }
            other => panic!("unexpected method: {}", other),
        }
    }
}
