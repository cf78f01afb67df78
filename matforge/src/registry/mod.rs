//! Flat name-indexed tool registry.
//!
//! Consumers see only `name`, `description`, `input_schema`, and `invoke`;
//! transport and server identity stay behind the adapters. The registry is
//! read by the agent thread and mutated by the loop thread (projection /
//! removal), so the map sits behind one coarse mutex.

mod remote;

pub use remote::RemoteToolAdapter;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::adaptor::AdaptorError;
use crate::bridge::SubmitError;
use crate::provider::{ContentPart, TransportError};

/// Specification of one callable tool, shaped like a `tools/list` entry.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema object with `properties`.
    pub input_schema: Value,
}

/// Typed content returned from one tool call.
#[derive(Clone, Debug)]
pub struct ToolContent {
    pub parts: Vec<ContentPart>,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    /// Flattens the typed parts into the single observation string the agent
    /// appends to the dialog.
    pub fn to_observation(&self) -> String {
        self.parts
            .iter()
            .map(ContentPart::render)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Errors from registry operations and tool invocations.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool already registered: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Adaptor(#[from] AdaptorError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("execution: {0}")]
    Execution(String),
}

impl ToolError {
    /// Short kind tag used to annotate error observations for the LLM.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidInput(_) => "invalid_input",
            ToolError::NotFound(_) => "unknown_tool",
            ToolError::Duplicate(_) => "duplicate_tool",
            ToolError::Transport(_) => "transport",
            ToolError::Adaptor(_) => "adaptor",
            ToolError::Submit(SubmitError::Timeout(_)) => "timeout",
            ToolError::Submit(_) => "bridge",
            ToolError::Execution(_) => "execution",
        }
    }
}

/// Metadata returned alongside the observation of one invocation.
#[derive(Clone, Debug)]
pub struct InvokeMeta {
    pub tool: String,
    pub origin_server: Option<String>,
}

/// A single callable tool. Calls are synchronous from the caller's view:
/// remote adapters block on the bridge internally.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolSpec;
    fn call(&self, args: Value) -> Result<ToolContent, ToolError>;
    /// Name of the provider server this tool came from, when remote.
    fn origin_server(&self) -> Option<&str> {
        None
    }
}

/// Flat mapping `qualified_name -> callable`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool; re-registering an existing name is a programmer
    /// error and is rejected rather than silently replaced.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let mut tools = self.tools.lock().unwrap();
        if tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        tracing::debug!("registered tool: {}", name);
        tools.insert(name, tool);
        Ok(())
    }

    /// Removes a tool; unknown names are ignored (removal is driven by the
    /// supervisor during teardown, which must not fail half-way).
    pub fn unregister(&self, name: &str) {
        if self.tools.lock().unwrap().remove(name).is_some() {
            tracing::debug!("unregistered tool: {}", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.lock().unwrap().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.lock().unwrap().get(name).cloned()
    }

    /// Sorted tool names (stable ordering for prompts and tests).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Specs of all registered tools, sorted by name.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let tools = self.tools.lock().unwrap();
        let mut specs: Vec<ToolSpec> = tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Parses `args_json`, dispatches to the named tool, and flattens the
    /// content into one observation string.
    pub fn invoke(&self, name: &str, args_json: &str) -> Result<(String, InvokeMeta), ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let args: Value = serde_json::from_str(args_json)
            .map_err(|e| ToolError::InvalidInput(format!("arguments not valid JSON: {}", e)))?;
        let content = tool.call(args)?;
        let meta = InvokeMeta {
            tool: name.to_string(),
            origin_server: tool.origin_server().map(str::to_string),
        };
        Ok((content.to_observation(), meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: Some("echo back".into()),
                input_schema: serde_json::json!({"type":"object","properties":{"text":{"type":"string"}}}),
            }
        }
        fn call(&self, args: Value) -> Result<ToolContent, ToolError> {
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidInput("missing text".into()))?;
            Ok(ToolContent::text(text))
        }
    }

    #[test]
    fn register_invoke_unregister() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let (obs, meta) = registry.invoke("echo", r#"{"text":"hi"}"#).unwrap();
        assert_eq!(obs, "hi");
        assert_eq!(meta.tool, "echo");
        assert!(meta.origin_server.is_none());

        registry.unregister("echo");
        assert!(registry.is_empty());
        assert!(matches!(
            registry.invoke("echo", "{}"),
            Err(ToolError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::Duplicate(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invoke_rejects_malformed_arguments() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.invoke("echo", "not json").unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[test]
    fn observation_joins_parts() {
        let content = ToolContent {
            parts: vec![
                ContentPart::Text("a".into()),
                ContentPart::Json(serde_json::json!({"k": 1})),
            ],
        };
        let obs = content.to_observation();
        assert!(obs.starts_with("a\n"));
        assert!(obs.contains("\"k\": 1"));
    }

    #[test]
    fn error_kinds_annotate() {
        assert_eq!(ToolError::NotFound("x".into()).kind(), "unknown_tool");
        assert_eq!(
            ToolError::Submit(SubmitError::Timeout(std::time::Duration::from_secs(1))).kind(),
            "timeout"
        );
    }
}
