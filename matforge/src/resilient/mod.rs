//! Resilient calculation engine: submit, monitor, diagnose, fix, retry.
//!
//! Long-running external jobs fail for mundane reasons (memory, walltime,
//! bad convergence settings). The engine watches the submitted job, maps
//! provider status strings onto Done/Failed/Unknown, and on failure looks up
//! config-driven fix actions by diagnosed error code, instructs the agent to
//! apply them and resubmit, then keeps monitoring the new job id.
//!
//! Status polling, diagnosis, and result fetching are provider-specific and
//! live behind `JobBackend`; wiring that trait to a concrete provider is the
//! embedder's job.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::agent::{AgentError, RunStatus, TrajectoryRecord};
use crate::solver::DirectSolver;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("job backend: {0}")]
    Backend(String),
    #[error("job {job_id} reported status '{raw}' which maps to Unknown; wire JobBackend::check_status to the provider's real states")]
    UnknownStatus { job_id: String, raw: String },
    #[error("no fix actions configured for error code '{0}'")]
    UnhandledError(String),
    #[error("fix run for job {0} produced no new job id")]
    ResubmitFailed(String),
}

/// Mapped job status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Done,
    Failed,
    Unknown,
}

/// Maps provider-specific status strings onto the engine's three states.
pub fn map_status(raw: &str) -> JobStatus {
    match raw.trim().to_lowercase().as_str() {
        "done" | "success" | "finished" => JobStatus::Done,
        "failed" | "error" | "cancelled" => JobStatus::Failed,
        _ => JobStatus::Unknown,
    }
}

/// Provider-side contracts the engine needs: poll, diagnose, fetch.
pub trait JobBackend: Send {
    /// Raw provider status string for the job.
    fn check_status(&mut self, job_id: &str) -> Result<String, JobError>;
    /// Error code for a failed job (the diagnosis skill's output), matched
    /// against the configured `error_handlers`.
    fn diagnose(&mut self, job_id: &str) -> Result<String, JobError>;
    fn fetch_results(&mut self, job_id: &str) -> Result<Value, JobError>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResilientConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// error code -> fix actions passed verbatim to the fix prompt.
    #[serde(default)]
    pub error_handlers: HashMap<String, Vec<Value>>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for ResilientConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            poll_interval_seconds: default_poll_interval(),
            error_handlers: HashMap::new(),
        }
    }
}

/// Terminal outcome of one resilient run.
#[derive(Clone, Debug)]
pub struct ResilientOutcome {
    pub status: RunStatus,
    pub job_id: Option<String>,
    pub retries: u32,
    pub results: Option<Value>,
    pub message: String,
}

/// Extracts the first job id from tool results whose tool name contains
/// `submit`: a JSON body carrying `job_id` or `id` (string or integer).
pub fn extract_job_id(records: &[TrajectoryRecord]) -> Option<String> {
    for record in records {
        let Some(results) = &record.tool_results else {
            continue;
        };
        for result in results {
            if !result.name.to_lowercase().contains("submit") || result.is_error {
                continue;
            }
            let Ok(body) = serde_json::from_str::<Value>(result.content.trim()) else {
                continue;
            };
            let id = body.get("job_id").or_else(|| body.get("id"));
            match id {
                Some(Value::String(s)) if !s.trim().is_empty() => {
                    return Some(s.trim().to_string())
                }
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

pub struct ResilientCalcEngine<B: JobBackend> {
    solver: DirectSolver,
    backend: B,
    config: ResilientConfig,
}

impl<B: JobBackend> ResilientCalcEngine<B> {
    pub fn new(solver: DirectSolver, backend: B, config: ResilientConfig) -> Self {
        Self {
            solver,
            backend,
            config,
        }
    }

    /// Runs the task through the agent; scans the new trajectory records for
    /// a submitted job id.
    fn run_agent(&self, task: &str) -> Result<(RunStatus, String, Option<String>), JobError> {
        let sink = self.solver.agent().sink().clone();
        let before = sink.records().len();
        let result = self.solver.solve(task)?;
        let job_id = extract_job_id(&sink.records()[before..]);
        Ok((result.status, result.final_message, job_id))
    }

    pub fn run(&mut self, task: &str) -> Result<ResilientOutcome, JobError> {
        tracing::info!(
            "resilient calculation: {}",
            task.chars().take(80).collect::<String>()
        );
        let (status, message, job_id) = self.run_agent(task)?;
        let Some(mut job_id) = job_id else {
            tracing::info!("no job id found; treating task as synchronous");
            return Ok(ResilientOutcome {
                status,
                job_id: None,
                retries: 0,
                results: None,
                message,
            });
        };

        let mut retries = 0;
        while retries < self.config.max_retries {
            let raw = self.backend.check_status(&job_id)?;
            tracing::info!("job {} status: {}", job_id, raw);
            match map_status(&raw) {
                JobStatus::Done => {
                    let results = self.backend.fetch_results(&job_id)?;
                    return Ok(ResilientOutcome {
                        status: RunStatus::Completed,
                        job_id: Some(job_id),
                        retries,
                        results: Some(results),
                        message: "calculation succeeded".into(),
                    });
                }
                JobStatus::Unknown => {
                    return Err(JobError::UnknownStatus { job_id, raw });
                }
                JobStatus::Failed => {
                    let code = self.backend.diagnose(&job_id)?;
                    tracing::info!("job {} diagnosed: {}", job_id, code);
                    let actions = self
                        .config
                        .error_handlers
                        .get(&code)
                        .cloned()
                        .ok_or(JobError::UnhandledError(code))?;

                    let fix_prompt = format!(
                        "Job {} failed.\nRequired actions: {}\n\
                         Apply these changes to the input files and resubmit the job.",
                        job_id,
                        serde_json::to_string(&actions).unwrap_or_default()
                    );
                    let (_, _, new_job_id) = self.run_agent(&fix_prompt)?;
                    match new_job_id {
                        Some(new_id) => {
                            job_id = new_id;
                            retries += 1;
                        }
                        None => return Err(JobError::ResubmitFailed(job_id)),
                    }
                }
            }
            std::thread::sleep(Duration::from_secs(self.config.poll_interval_seconds));
        }

        Ok(ResilientOutcome {
            status: RunStatus::Failed,
            job_id: Some(job_id),
            retries,
            results: None,
            message: format!("calculation failed after {} retries", retries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentRuntime, TrajectorySink};
    use crate::bridge::ToolLoop;
    use crate::llm::{LlmResponse, MockLlm};
    use crate::message::ToolCall;
    use crate::registry::{Tool, ToolContent, ToolError, ToolRegistry, ToolSpec};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Submit tool handing out J1, J2, ... per call.
    struct SubmitTool {
        counter: AtomicU32,
    }

    impl Tool for SubmitTool {
        fn name(&self) -> &str {
            "hpc_submit_job"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "hpc_submit_job".into(),
                description: None,
                input_schema: serde_json::json!({"type":"object","properties":{}}),
            }
        }
        fn call(&self, _args: Value) -> Result<ToolContent, ToolError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ToolContent {
                parts: vec![crate::provider::ContentPart::Json(
                    serde_json::json!({"job_id": format!("J{}", n)}),
                )],
            })
        }
    }

    struct ScriptedBackend {
        statuses: VecDeque<&'static str>,
        diagnosis: &'static str,
    }

    impl JobBackend for ScriptedBackend {
        fn check_status(&mut self, _job_id: &str) -> Result<String, JobError> {
            Ok(self
                .statuses
                .pop_front()
                .unwrap_or("Unknown")
                .to_string())
        }
        fn diagnose(&mut self, _job_id: &str) -> Result<String, JobError> {
            Ok(self.diagnosis.to_string())
        }
        fn fetch_results(&mut self, job_id: &str) -> Result<Value, JobError> {
            Ok(serde_json::json!({"job_id": job_id, "energy": -12.5}))
        }
    }

    fn submit_then_finish() -> Vec<LlmResponse> {
        vec![
            LlmResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "hpc_submit_job".into(),
                    arguments: "{}".into(),
                }],
                usage: None,
            },
            LlmResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c2".into(),
                    name: crate::agent::TOOL_FINISH.into(),
                    arguments: r#"{"message":"submitted","task_completed":"true"}"#.into(),
                }],
                usage: None,
            },
        ]
    }

    fn solver_with(responses: Vec<LlmResponse>) -> DirectSolver {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(SubmitTool {
                counter: AtomicU32::new(0),
            }))
            .unwrap();
        DirectSolver::new(AgentRuntime::new(
            "calc",
            Arc::new(MockLlm::new(responses)),
            registry,
            Arc::new(ToolLoop::start().unwrap()),
            Arc::new(TrajectorySink::new()),
            "run calculations",
            AgentConfig {
                max_turns: 4,
                ..AgentConfig::default()
            },
        ))
    }

    fn config_with_oom_handler() -> ResilientConfig {
        let mut error_handlers = HashMap::new();
        error_handlers.insert("OOM".to_string(), vec![serde_json::json!({"set": "mem=64G"})]);
        ResilientConfig {
            max_retries: 3,
            poll_interval_seconds: 0,
            error_handlers,
        }
    }

    #[test]
    fn failed_job_is_fixed_resubmitted_and_succeeds() {
        let mut responses = submit_then_finish();
        responses.extend(submit_then_finish());
        let mut engine = ResilientCalcEngine::new(
            solver_with(responses),
            ScriptedBackend {
                statuses: ["Failed", "Done"].into(),
                diagnosis: "OOM",
            },
            config_with_oom_handler(),
        );

        let outcome = engine.run("relax the structure on the cluster").unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.retries, 1);
        assert_eq!(outcome.job_id.as_deref(), Some("J2"));
        assert_eq!(outcome.results.unwrap()["job_id"], "J2");
    }

    #[test]
    fn synchronous_task_returns_immediately() {
        let responses = vec![LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: crate::agent::TOOL_FINISH.into(),
                arguments: r#"{"message":"analysis done","task_completed":"true"}"#.into(),
            }],
            usage: None,
        }];
        let mut engine = ResilientCalcEngine::new(
            solver_with(responses),
            ScriptedBackend {
                statuses: VecDeque::new(),
                diagnosis: "",
            },
            ResilientConfig::default(),
        );
        let outcome = engine.run("just analyze locally").unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.job_id.is_none());
        assert_eq!(outcome.retries, 0);
        assert_eq!(outcome.message, "analysis done");
    }

    #[test]
    fn unknown_status_aborts_with_wiring_message() {
        let mut engine = ResilientCalcEngine::new(
            solver_with(submit_then_finish()),
            ScriptedBackend {
                statuses: ["Queued-Phase-9"].into(),
                diagnosis: "",
            },
            config_with_oom_handler(),
        );
        let err = engine.run("submit job").unwrap_err();
        match err {
            JobError::UnknownStatus { job_id, raw } => {
                assert_eq!(job_id, "J1");
                assert_eq!(raw, "Queued-Phase-9");
            }
            other => panic!("expected UnknownStatus, got {:?}", other),
        }
    }

    #[test]
    fn unhandled_error_code_aborts() {
        let mut engine = ResilientCalcEngine::new(
            solver_with(submit_then_finish()),
            ScriptedBackend {
                statuses: ["Failed"].into(),
                diagnosis: "DISK_FULL",
            },
            config_with_oom_handler(),
        );
        let err = engine.run("submit job").unwrap_err();
        assert!(matches!(err, JobError::UnhandledError(code) if code == "DISK_FULL"));
    }

    #[test]
    fn retries_exhausted_reports_failure() {
        let mut responses = submit_then_finish();
        for _ in 0..3 {
            responses.extend(submit_then_finish());
        }
        let mut engine = ResilientCalcEngine::new(
            solver_with(responses),
            ScriptedBackend {
                statuses: ["Failed", "Failed", "Failed", "Failed"].into(),
                diagnosis: "OOM",
            },
            config_with_oom_handler(),
        );
        let outcome = engine.run("keep trying").unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.retries, 3);
    }

    #[test]
    fn status_mapping_covers_provider_spellings() {
        assert_eq!(map_status("Success"), JobStatus::Done);
        assert_eq!(map_status("finished"), JobStatus::Done);
        assert_eq!(map_status("Cancelled"), JobStatus::Failed);
        assert_eq!(map_status("ERROR"), JobStatus::Failed);
        assert_eq!(map_status("pending-weird"), JobStatus::Unknown);
    }

    #[test]
    fn extract_job_id_accepts_numeric_ids_and_skips_non_submit_tools() {
        use crate::message::{Role, ToolResult};
        let records = vec![
            TrajectoryRecord::new("a", Role::Tool, "").with_tool_results(vec![ToolResult {
                call_id: "c0".into(),
                name: "hpc_query".into(),
                content: r#"{"id": "not-from-submit"}"#.into(),
                is_error: false,
            }]),
            TrajectoryRecord::new("a", Role::Tool, "").with_tool_results(vec![ToolResult {
                call_id: "c1".into(),
                name: "hpc_submit_job".into(),
                content: r#"{"id": 12345}"#.into(),
                is_error: false,
            }]),
        ];
        assert_eq!(extract_job_id(&records).as_deref(), Some("12345"));
    }
}
