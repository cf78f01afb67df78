//! Matforge: tool orchestration runtime for materials-science agents.
//!
//! The runtime supervises a fleet of external tool providers (JSON-RPC over
//! stdio subprocesses or HTTP/SSE), projects their tools into one flat
//! registry for an LLM-driven agent, and bridges the synchronous caller
//! world with a single long-lived cooperative event loop. On top of that it
//! runs a deterministic plan-execute engine (generate, validate against an
//! immutable policy, human gate, execute with persistence) and a resilient
//! submit-monitor-diagnose-retry loop for long-running calculation jobs.
//!
//! # Subsystems
//!
//! - [`bridge`]: the tool loop — one current-thread runtime on a dedicated
//!   thread, thread-safe submission with deadlines.
//! - [`provider`]: transport-specific JSON-RPC clients (`tools/list`,
//!   `tools/call`).
//! - [`supervisor`]: per-server supervisor fibers, hot add/remove, registry
//!   projection.
//! - [`registry`]: flat `qualified_name -> callable` directory.
//! - [`adaptor`]: per-invocation path-argument rewriting and credential
//!   injection for calculation tools.
//! - [`agent`], [`solver`]: the LLM turn loop and its one-shot wrapper.
//! - [`planner`]: plan-execute engine with policy watchdog and resume.
//! - [`resilient`]: retry engine for external jobs.
//! - [`skills`]: directory-bundled knowledge/operator skills.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use matforge::bridge::ToolLoop;
//! use matforge::provider::{StdioServerParams, TransportParams};
//! use matforge::registry::ToolRegistry;
//! use matforge::supervisor::{ServerSupervisor, SupervisorConfig};
//!
//! let tool_loop = Arc::new(ToolLoop::start().unwrap());
//! let supervisor = Arc::new(ServerSupervisor::new(
//!     Arc::clone(&tool_loop),
//!     SupervisorConfig::default(),
//!     None,
//! ));
//! let registry = Arc::new(ToolRegistry::new());
//! supervisor.register_tools(&registry);
//! supervisor
//!     .add_server_blocking(
//!         "calc",
//!         TransportParams::Stdio(StdioServerParams {
//!             command: "calc-tool-server".into(),
//!             args: vec![],
//!             env: Default::default(),
//!         }),
//!     )
//!     .unwrap();
//! let (observation, _meta) = registry.invoke("calc_get_structure_info", "{}").unwrap();
//! println!("{}", observation);
//! ```

pub mod adaptor;
pub mod agent;
pub mod bridge;
pub mod llm;
pub mod message;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod resilient;
pub mod rundir;
pub mod session;
pub mod skills;
pub mod solver;
pub mod supervisor;

pub use adaptor::{AdaptorError, ObjectStore, OssUploader, PathAdaptor};
pub use agent::{
    AgentConfig, AgentError, AgentRuntime, RunResult, RunStatus, TrajectoryRecord, TrajectorySink,
};
pub use bridge::{SubmitError, ToolLoop, DEFAULT_DEADLINE};
pub use llm::{LlmClient, LlmError, LlmResponse, MockLlm, OpenAiChat};
pub use message::{Message, Role, ToolCall, ToolResult};
pub use planner::{
    ConsoleGate, Gate, GateDecision, Plan, PlanError, PlanExecuteEngine, PlannerConfig,
    ResearchState,
};
pub use provider::{ProviderConnection, TransportError, TransportParams};
pub use registry::{RemoteToolAdapter, Tool, ToolContent, ToolError, ToolRegistry, ToolSpec};
pub use resilient::{JobBackend, JobError, ResilientCalcEngine, ResilientConfig, ResilientOutcome};
pub use rundir::{read_json, write_json_atomic, RunDir};
pub use session::{ExecSession, LocalSession, SessionError};
pub use skills::{Skill, SkillRegistry, UseSkillTool};
pub use solver::DirectSolver;
pub use supervisor::{ConnectionState, ServerSupervisor, SupervisorConfig, SupervisorError};
