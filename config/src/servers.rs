//! Tool-server config JSON: `{ "mcpServers": { name: server } }`.
//!
//! A server entry is either `{command, args?, env?}` (stdio) or
//! `{transport, url, headers?}` (http / sse / streamable-http). The reserved
//! token `__EVOMASTER_WORKSPACES__` anywhere in the document is replaced by
//! the absolute workspaces path before use.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

/// Placeholder substituted with `{run_dir}/workspaces`.
pub const WORKSPACES_PLACEHOLDER: &str = "__EVOMASTER_WORKSPACES__";

#[derive(Debug, thiserror::Error)]
pub enum ServersError {
    #[error("read server config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse server config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One parsed server entry.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerEntry {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Remote {
        transport: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Transports the runtime knows how to open.
const REMOTE_TRANSPORTS: &[&str] = &["http", "sse", "streamable-http", "streamable_http"];

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, Value>,
}

/// Parsed config: valid servers in name order, plus the names that were
/// skipped (unknown transport or malformed entry) for the caller to log.
#[derive(Debug, Default)]
pub struct LoadedServers {
    pub servers: Vec<(String, ServerEntry)>,
    pub skipped: Vec<String>,
}

/// Recursively replaces the placeholder in every string of the document.
fn deep_replace(value: Value, from: &str, to: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(from, to)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| deep_replace(v, from, to))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, deep_replace(v, from, to)))
                .collect(),
        ),
        other => other,
    }
}

/// Parses server config text. `workspaces_root`, when given, is substituted
/// for the placeholder token before interpretation.
pub fn parse_servers(
    text: &str,
    workspaces_root: Option<&Path>,
) -> Result<LoadedServers, ServersError> {
    let mut document: Value = serde_json::from_str(text)?;
    if let Some(root) = workspaces_root {
        document = deep_replace(
            document,
            WORKSPACES_PLACEHOLDER,
            &root.to_string_lossy(),
        );
    }
    let file: ServersFile = serde_json::from_value(document)?;

    let mut loaded = LoadedServers::default();
    for (name, entry) in file.mcp_servers {
        match serde_json::from_value::<ServerEntry>(entry) {
            Ok(server @ ServerEntry::Stdio { .. }) => loaded.servers.push((name, server)),
            Ok(server @ ServerEntry::Remote { .. }) => {
                let known = matches!(&server, ServerEntry::Remote { transport, .. }
                    if REMOTE_TRANSPORTS.contains(&transport.to_lowercase().as_str()));
                if known {
                    loaded.servers.push((name, server));
                } else {
                    loaded.skipped.push(name);
                }
            }
            Err(_) => loaded.skipped.push(name),
        }
    }
    Ok(loaded)
}

/// Reads and parses a server config file.
pub fn load_servers(
    path: &Path,
    workspaces_root: Option<&Path>,
) -> Result<LoadedServers, ServersError> {
    let text = std::fs::read_to_string(path)?;
    parse_servers(&text, workspaces_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stdio_and_remote_entries() {
        let text = r#"{
            "mcpServers": {
                "calc": {"command": "calc-server", "args": ["--n=2"], "env": {"K": "v"}},
                "web": {"transport": "streamable-http", "url": "https://mcp.example/mcp",
                        "headers": {"X-Key": "k"}}
            }
        }"#;
        let loaded = parse_servers(text, None).unwrap();
        assert_eq!(loaded.servers.len(), 2);
        assert!(loaded.skipped.is_empty());
        match &loaded.servers[0] {
            (name, ServerEntry::Stdio { command, args, env }) => {
                assert_eq!(name, "calc");
                assert_eq!(command, "calc-server");
                assert_eq!(args, &vec!["--n=2".to_string()]);
                assert_eq!(env.get("K").unwrap(), "v");
            }
            other => panic!("expected stdio entry, got {:?}", other),
        }
    }

    #[test]
    fn placeholder_is_replaced_everywhere() {
        let text = r#"{
            "mcpServers": {
                "fs": {"command": "fs-server", "args": ["--root", "__EVOMASTER_WORKSPACES__/t1"],
                        "env": {"WS": "__EVOMASTER_WORKSPACES__"}}
            }
        }"#;
        let loaded = parse_servers(text, Some(Path::new("/runs/r1/workspaces"))).unwrap();
        match &loaded.servers[0].1 {
            ServerEntry::Stdio { args, env, .. } => {
                assert_eq!(args[1], "/runs/r1/workspaces/t1");
                assert_eq!(env.get("WS").unwrap(), "/runs/r1/workspaces");
            }
            other => panic!("expected stdio entry, got {:?}", other),
        }
    }

    #[test]
    fn unknown_transport_and_malformed_entries_are_skipped() {
        let text = r#"{
            "mcpServers": {
                "good": {"command": "x"},
                "weird": {"transport": "carrier-pigeon", "url": "coop://x"},
                "broken": {"neither": true}
            }
        }"#;
        let loaded = parse_servers(text, None).unwrap();
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.skipped, vec!["broken".to_string(), "weird".to_string()]);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(matches!(
            parse_servers("{nope", None),
            Err(ServersError::Parse(_))
        ));
    }

    #[test]
    fn load_servers_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, r#"{"mcpServers": {"s": {"command": "echo_tool"}}}"#).unwrap();
        let loaded = load_servers(&path, None).unwrap();
        assert_eq!(loaded.servers.len(), 1);
    }
}
