//! Direct solver: one agent run for one free-form task.
//!
//! This is the leaf executor of the plan-execute engine; each plan step
//! becomes one `solve` call.

use crate::agent::{AgentError, AgentRuntime, RunResult};

pub struct DirectSolver {
    agent: AgentRuntime,
}

impl DirectSolver {
    pub fn new(agent: AgentRuntime) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &AgentRuntime {
        &self.agent
    }

    pub fn solve(&self, task: &str) -> Result<RunResult, AgentError> {
        tracing::info!("direct solve: {}", task.chars().take(80).collect::<String>());
        self.agent.run(task)
    }
}
