//! Plan-execute engine: generate a plan, validate it against the embedded
//! policy, pass the pre-flight human gate, then execute step by step with
//! state persisted after every step.
//!
//! Resume is cheap by design: `research_state.json` is re-read on start and
//! a matching goal skips re-planning entirely, continuing from the first
//! step that is not `Done`.

pub mod plan;
pub mod policy;

pub use plan::{ComputeCost, Fidelity, Plan, PlanStatus, Step, StepStatus};

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentError;
use crate::bridge::{SubmitError, ToolLoop};
use crate::llm::{LlmClient, LlmError};
use crate::message::Message;
use crate::registry::ToolRegistry;
use crate::rundir::{read_json, write_json_atomic, RunDir};
use crate::solver::DirectSolver;

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the research planner of an autonomous materials-science agent. \
Given the runtime context and the available tools, produce ONE research plan \
as a single JSON object with fields: strategy_name, fidelity_level \
(screening|production), and steps — an array of \
{tool_name, intent, compute_cost (low|medium|high), requires_human_confirm, \
fallback_logic}. Use only tools from the provided list. Keep steps minimal \
and concrete. If the request cannot be served within policy, answer with \
{\"status\": \"Refused\", \"refusal_reason\": \"...\"}. Output JSON only.";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Refused by the planner itself or by the policy watchdog.
    #[error("plan refused: {0}")]
    Refused(String),
    #[error("run aborted at the pre-flight gate")]
    Aborted,
    #[error("malformed plan: {0}")]
    Malformed(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Bridge(#[from] SubmitError),
    #[error("state: {0}")]
    State(#[from] std::io::Error),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Decision from the pre-flight review of a rendered plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Go,
    Abort,
    Revise(String),
}

/// Human gate: plan review plus per-step confirmation. Behind a trait so the
/// engine is testable without a TTY.
pub trait Gate: Send {
    fn review_plan(&mut self, rendered: &str) -> GateDecision;
    fn confirm_step(&mut self, prompt: &str) -> bool;
}

/// Gate reading single lines from stdin: `go` proceeds, `abort` exits,
/// empty input re-prompts, anything else is revision feedback.
#[derive(Default)]
pub struct ConsoleGate;

impl Gate for ConsoleGate {
    fn review_plan(&mut self, rendered: &str) -> GateDecision {
        println!("{}", rendered);
        loop {
            print!("[go / abort / revision feedback] > ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => return GateDecision::Abort,
                Ok(_) => {}
            }
            match line.trim() {
                "" => continue,
                "go" => return GateDecision::Go,
                "abort" => return GateDecision::Abort,
                feedback => return GateDecision::Revise(feedback.to_string()),
            }
        }
    }

    fn confirm_step(&mut self, prompt: &str) -> bool {
        print!("{} [y/n] > ", prompt);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => false,
            Ok(_) => line.trim().eq_ignore_ascii_case("y"),
        }
    }
}

/// Context object serialized into the planner's user message.
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeContext {
    pub hardware_has_gpu: bool,
    pub active_licenses: Vec<String>,
    pub internet: bool,
    pub target_fidelity: Fidelity,
    pub max_steps: usize,
    pub user_intent: String,
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub max_steps: usize,
    pub hardware_has_gpu: bool,
    pub target_fidelity: Fidelity,
    pub llm_deadline: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            hardware_has_gpu: false,
            target_fidelity: Fidelity::Screening,
            llm_deadline: Duration::from_secs(300),
        }
    }
}

/// Persisted planner state: goal, plan, and per-step history records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResearchState {
    pub goal: String,
    pub plan: Plan,
    pub history: Vec<Value>,
}

impl ResearchState {
    /// True when every step ended in `Done` or `Skipped`.
    pub fn is_complete(&self) -> bool {
        self.plan
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Done | StepStatus::Skipped))
    }
}

pub struct PlanExecuteEngine {
    llm: Arc<dyn LlmClient>,
    tool_loop: Arc<ToolLoop>,
    registry: Arc<ToolRegistry>,
    solver: DirectSolver,
    run_dir: RunDir,
    gate: Box<dyn Gate>,
    config: PlannerConfig,
}

impl PlanExecuteEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tool_loop: Arc<ToolLoop>,
        registry: Arc<ToolRegistry>,
        solver: DirectSolver,
        run_dir: RunDir,
        gate: Box<dyn Gate>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            llm,
            tool_loop,
            registry,
            solver,
            run_dir,
            gate,
            config,
        }
    }

    /// Full pipeline: resume-or-plan, gate, execute.
    pub fn run(&mut self, task: &str) -> Result<ResearchState, PlanError> {
        if let Some(state) = self.try_resume(task)? {
            tracing::info!(
                "resuming research plan '{}' from step {:?}",
                state.plan.plan_id,
                state.plan.next_pending().map(|i| i + 1)
            );
            return self.execute(state);
        }

        let mut plan = self.generate(task)?;
        loop {
            if plan.status == PlanStatus::Refused {
                let reason = plan
                    .refusal_reason
                    .unwrap_or_else(|| "no reason given".into());
                return Err(PlanError::Refused(reason));
            }
            match self.gate.review_plan(&plan.render()) {
                GateDecision::Go => break,
                GateDecision::Abort => return Err(PlanError::Aborted),
                GateDecision::Revise(feedback) => {
                    tracing::info!("revising plan from reviewer feedback");
                    plan = self.revise(task, &plan, &feedback)?;
                }
            }
        }

        let state = ResearchState {
            goal: task.to_string(),
            plan,
            history: Vec::new(),
        };
        self.persist(&state)?;
        self.execute(state)
    }

    fn try_resume(&self, task: &str) -> Result<Option<ResearchState>, PlanError> {
        let state: Option<ResearchState> = read_json(&self.run_dir.research_state_file())?;
        Ok(state.filter(|s| s.goal == task && !s.plan.steps.is_empty()))
    }

    fn invoke_planner(&self, messages: Vec<Message>) -> Result<String, PlanError> {
        let llm = Arc::clone(&self.llm);
        let reply = self.tool_loop.submit_with_deadline(
            async move { llm.invoke(&messages, &[]).await },
            self.config.llm_deadline,
        )??;
        Ok(reply.content)
    }

    /// Extraction + parse + normalize + watchdog, shared by generate and
    /// revise. Parse failures become refusals, not crashes.
    fn plan_from_reply(&self, reply: &str) -> Plan {
        let Some(json_text) = plan::extract_json_object(reply) else {
            return Plan::refused("Invalid JSON");
        };
        let Ok(raw) = serde_json::from_str::<Value>(json_text) else {
            return Plan::refused("Invalid JSON");
        };
        let normalized = match plan::normalize(&raw, self.config.max_steps) {
            Ok(plan) => plan,
            Err(e) => return Plan::refused(e.to_string()),
        };
        policy::validate(&normalized)
    }

    fn generate(&self, task: &str) -> Result<Plan, PlanError> {
        let context = RuntimeContext {
            hardware_has_gpu: self.config.hardware_has_gpu,
            active_licenses: policy::ACTIVE_LICENSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            internet: true,
            target_fidelity: self.config.target_fidelity,
            max_steps: self.config.max_steps,
            user_intent: task.to_string(),
        };
        let system = format!("{}\n\n{}", PLANNER_SYSTEM_PROMPT, policy::policy_prompt_block());
        let user = json!({
            "runtime_context": context,
            "available_tools": self.registry.names(),
        });
        let reply = self.invoke_planner(vec![
            Message::system(system),
            Message::user(serde_json::to_string_pretty(&user).unwrap_or_default()),
        ])?;
        Ok(self.plan_from_reply(&reply))
    }

    fn revise(&self, task: &str, current: &Plan, feedback: &str) -> Result<Plan, PlanError> {
        let system = format!("{}\n\n{}", PLANNER_SYSTEM_PROMPT, policy::policy_prompt_block());
        let user = format!(
            "Task: {}\n\nCurrent plan:\n{}\n\nReviewer feedback:\n{}\n\n\
             Produce the revised plan as a single JSON object.",
            task,
            serde_json::to_string_pretty(current).unwrap_or_default(),
            feedback
        );
        let reply =
            self.invoke_planner(vec![Message::system(system), Message::user(user)])?;
        Ok(self.plan_from_reply(&reply))
    }

    fn persist(&self, state: &ResearchState) -> Result<(), PlanError> {
        write_json_atomic(&self.run_dir.research_state_file(), state)?;
        Ok(())
    }

    /// Executes every non-`Done` step in order, persisting after each one.
    /// Step failures are recorded and execution continues.
    fn execute(&mut self, mut state: ResearchState) -> Result<ResearchState, PlanError> {
        for idx in 0..state.plan.steps.len() {
            if state.plan.steps[idx].status == StepStatus::Done {
                continue;
            }
            let step = state.plan.steps[idx].clone();

            if step.requires_human_confirm || step.compute_cost == ComputeCost::High {
                let prompt = format!(
                    "Step {} runs '{}' ({:?} cost). Proceed?",
                    step.step_id, step.tool_name, step.compute_cost
                );
                if !self.gate.confirm_step(&prompt) {
                    tracing::info!("step {} skipped at the gate", step.step_id);
                    state.plan.steps[idx].status = StepStatus::Skipped;
                    self.persist(&state)?;
                    continue;
                }
            }

            self.run_dir.step_workspace(step.step_id)?;
            let prompt = format!(
                "Use tool '{}' to: {}. Fallback: {}",
                step.tool_name, step.intent, step.fallback_logic
            );
            match self.solver.solve(&prompt) {
                Ok(result) => {
                    state.plan.steps[idx].status = StepStatus::Done;
                    state.history.push(json!({
                        "step_id": step.step_id,
                        "tool_name": step.tool_name,
                        "intent": step.intent,
                        "result_summary": result.final_message,
                    }));
                }
                Err(e) => {
                    tracing::warn!("step {} failed: {}", step.step_id, e);
                    state.plan.steps[idx].status = StepStatus::Failed;
                    state.history.push(json!({
                        "step_id": step.step_id,
                        "error": e.to_string(),
                    }));
                }
            }
            self.persist(&state)?;
        }
        Ok(state)
    }
}
