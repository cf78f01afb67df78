//! Adapter that exposes one provider tool as a registry `Tool`.
//!
//! `call` runs on the blocking caller side: the adaptor resolves arguments
//! first (uploads happen off the loop), then the RPC future is submitted to
//! the tool loop and awaited with the invocation deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::adaptor::PathAdaptor;
use crate::bridge::{ToolLoop, DEFAULT_DEADLINE};
use crate::provider::{ProviderConnection, RemoteTool};

use super::{Tool, ToolContent, ToolError, ToolSpec};

/// One remote tool, qualified as `{server}_{remote_name}`.
pub struct RemoteToolAdapter {
    qualified_name: String,
    remote_name: String,
    origin_server: String,
    description: Option<String>,
    input_schema: Value,
    connection: Arc<ProviderConnection>,
    tool_loop: Arc<ToolLoop>,
    adaptor: Option<Arc<PathAdaptor>>,
    workspace_root: PathBuf,
    deadline: Duration,
}

impl RemoteToolAdapter {
    pub fn new(
        origin_server: &str,
        remote: RemoteTool,
        connection: Arc<ProviderConnection>,
        tool_loop: Arc<ToolLoop>,
        adaptor: Option<Arc<PathAdaptor>>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            qualified_name: format!("{}_{}", origin_server, remote.name),
            remote_name: remote.name,
            origin_server: origin_server.to_string(),
            description: remote.description,
            input_schema: remote.input_schema,
            connection,
            tool_loop,
            adaptor,
            workspace_root,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

impl Tool for RemoteToolAdapter {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    fn origin_server(&self) -> Option<&str> {
        Some(&self.origin_server)
    }

    fn call(&self, args: Value) -> Result<ToolContent, ToolError> {
        let effective = match &self.adaptor {
            Some(adaptor) => adaptor.resolve(
                &self.workspace_root,
                &args,
                &self.qualified_name,
                &self.origin_server,
                Some(&self.input_schema),
            )?,
            None => args,
        };

        let connection = Arc::clone(&self.connection);
        let remote_name = self.remote_name.clone();
        let parts = self
            .tool_loop
            .submit_with_deadline(
                async move { connection.call_tool(&remote_name, effective).await },
                self.deadline,
            )??;
        Ok(ToolContent { parts })
    }
}
