//! Agent runtime: the turn loop between the LLM and the tool registry.
//!
//! One turn: build the dialog from system prompt, task, and history; query
//! the LLM through the bridge; dispatch any tool calls through the registry;
//! append observations. The loop ends only when the LLM calls `finish` with
//! `task_completed = true` — `partial` keeps it going — or when the turn
//! budget runs out, which ends the run as `exhausted`. Tool failures become
//! annotated observations the LLM can react to; they never crash the loop.

mod trajectory;

pub use trajectory::{TrajectoryRecord, TrajectorySink};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::{SubmitError, ToolLoop};
use crate::llm::{LlmClient, LlmError};
use crate::message::{Message, Role, ToolCall, ToolResult};
use crate::registry::{ToolRegistry, ToolSpec};

/// Name of the built-in termination tool.
pub const TOOL_FINISH: &str = "finish";

const NUDGE: &str = "Reminder: to end the task you must call the `finish` tool with \
`task_completed` set. Continue working, or call finish now.";

/// How one run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Exhausted,
    Failed,
    Aborted,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub final_message: String,
    pub turns: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Bridge(#[from] SubmitError),
    #[error("trajectory: {0}")]
    Trajectory(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_turns: u32,
    /// Cap on dialog messages sent to the LLM; the system prompt and task
    /// always survive, the middle of the history is dropped first.
    pub max_context_messages: usize,
    /// Deadline for one LLM call submitted through the bridge.
    pub llm_deadline: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_context_messages: 60,
            llm_deadline: Duration::from_secs(300),
        }
    }
}

pub struct AgentRuntime {
    name: String,
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    tool_loop: Arc<ToolLoop>,
    sink: Arc<TrajectorySink>,
    system_prompt: String,
    config: AgentConfig,
}

impl AgentRuntime {
    pub fn new(
        name: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        tool_loop: Arc<ToolLoop>,
        sink: Arc<TrajectorySink>,
        system_prompt: impl Into<String>,
        config: AgentConfig,
    ) -> Self {
        Self {
            name: name.into(),
            llm,
            registry,
            tool_loop,
            sink,
            system_prompt: system_prompt.into(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sink(&self) -> &Arc<TrajectorySink> {
        &self.sink
    }

    /// Spec of the built-in finish tool, offered to the LLM on every turn.
    pub fn finish_spec() -> ToolSpec {
        ToolSpec {
            name: TOOL_FINISH.into(),
            description: Some(
                "Signal task completion. Set task_completed to \"true\" only when all \
                 objectives are met; use \"partial\" to report progress and continue."
                    .into(),
            ),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Summary of the outcome."},
                    "task_completed": {
                        "type": "string",
                        "enum": ["true", "partial", "false"]
                    }
                },
                "required": ["message", "task_completed"]
            }),
        }
    }

    fn record(&self, record: TrajectoryRecord) -> Result<(), AgentError> {
        self.sink.append([record])?;
        Ok(())
    }

    /// Dialog window: system prompt and task survive, then the most recent
    /// messages up to the configured cap.
    fn context_window(&self, messages: &[Message]) -> Vec<Message> {
        let cap = self.config.max_context_messages.max(4);
        if messages.len() <= cap {
            return messages.to_vec();
        }
        let head = 2.min(messages.len());
        let tail = cap - head;
        let mut window: Vec<Message> = messages[..head].to_vec();
        window.extend_from_slice(&messages[messages.len() - tail..]);
        window
    }

    /// Runs one task to termination.
    pub fn run(&self, task: &str) -> Result<RunResult, AgentError> {
        let mut messages = vec![
            Message::system(&self.system_prompt),
            Message::user(task),
        ];
        self.record(TrajectoryRecord::new(&self.name, Role::User, task))?;

        let mut last_assistant = String::new();
        for turn in 1..=self.config.max_turns {
            let reply = {
                let llm = Arc::clone(&self.llm);
                let window = self.context_window(&messages);
                let mut specs = self.registry.list_specs();
                specs.push(Self::finish_spec());
                self.tool_loop.submit_with_deadline(
                    async move { llm.invoke(&window, &specs).await },
                    self.config.llm_deadline,
                )??
            };

            tracing::debug!(
                "agent '{}' turn {}: {} tool calls",
                self.name,
                turn,
                reply.tool_calls.len()
            );
            last_assistant = reply.content.clone();
            messages.push(Message::assistant_with_calls(
                reply.content.clone(),
                reply.tool_calls.clone(),
            ));
            self.record(
                TrajectoryRecord::new(&self.name, Role::Assistant, reply.content.clone())
                    .with_tool_calls(reply.tool_calls.clone()),
            )?;

            if reply.tool_calls.is_empty() {
                // Prose without a finish call does not end the task.
                messages.push(Message::user(NUDGE));
                self.record(TrajectoryRecord::new(&self.name, Role::User, NUDGE))?;
                continue;
            }

            let mut results = Vec::new();
            for call in &reply.tool_calls {
                if call.name == TOOL_FINISH {
                    if let Some(message) = self.handle_finish(call, &mut messages, &mut results)? {
                        self.record(
                            TrajectoryRecord::new(&self.name, Role::Tool, "")
                                .with_tool_results(results),
                        )?;
                        return Ok(RunResult {
                            status: RunStatus::Completed,
                            final_message: message,
                            turns: turn,
                        });
                    }
                    continue;
                }
                let observation = match self.registry.invoke(&call.name, &call.arguments) {
                    Ok((obs, _meta)) => obs,
                    Err(e) => format!("[tool error: {}] {}", e.kind(), e),
                };
                let is_error = observation.starts_with("[tool error:");
                messages.push(Message::tool(call.id.clone(), observation.clone()));
                results.push(ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: observation,
                    is_error,
                });
            }
            self.record(
                TrajectoryRecord::new(&self.name, Role::Tool, "").with_tool_results(results),
            )?;
        }

        Ok(RunResult {
            status: RunStatus::Exhausted,
            final_message: last_assistant,
            turns: self.config.max_turns,
        })
    }

    /// Handles one finish call. Returns the final message when the task is
    /// actually complete; otherwise records a continue observation.
    fn handle_finish(
        &self,
        call: &ToolCall,
        messages: &mut Vec<Message>,
        results: &mut Vec<ToolResult>,
    ) -> Result<Option<String>, AgentError> {
        let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
        let message = args
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let completed = match args.get("task_completed") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if completed {
            return Ok(Some(message));
        }
        let observation =
            "Task not complete (task_completed != true); continue working toward the objectives."
                .to_string();
        messages.push(Message::tool(call.id.clone(), observation.clone()));
        results.push(ToolResult {
            call_id: call.id.clone(),
            name: TOOL_FINISH.into(),
            content: observation,
            is_error: false,
        });
        Ok(None)
    }
}
