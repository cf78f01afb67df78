//! matforge CLI: run one task in direct (single agent) or planner
//! (plan-execute) mode.
//!
//! Exit codes: 0 completed, 1 fatal configuration error, 2 aborted at the
//! pre-flight gate, 3 failed or exhausted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use clap::{Parser, ValueEnum};

use matforge::planner::Fidelity;
use matforge::{
    AdaptorError, AgentConfig, AgentRuntime, ConsoleGate, DirectSolver, LocalSession, ObjectStore,
    OssUploader, PathAdaptor, PlanError, PlanExecuteEngine, PlannerConfig, RunDir, RunStatus,
    ServerSupervisor, SkillRegistry, SupervisorConfig, ToolLoop, ToolRegistry, TrajectorySink,
    UseSkillTool,
};

const SYSTEM_PROMPT: &str = "\
You are Matforge, an autonomous agent for materials science and computational \
materials. Complete the task by combining the registered tools: structure \
generation and manipulation, literature and web search, document parsing, \
database retrieval, and calculation submission. Heavy ab-initio or molecular \
dynamics runs go through the calculation tools that submit to external \
clusters; never run such codes locally. When the task is done, call the \
finish tool with task_completed set.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One agent run on the task.
    Direct,
    /// Plan, validate, gate, then execute step by step.
    Planner,
}

#[derive(Debug, Parser)]
#[command(name = "matforge", about = "Materials-science agent runtime")]
struct Args {
    /// Task description to run.
    #[arg(long)]
    task: String,

    #[arg(long, value_enum, default_value_t = Mode::Direct)]
    mode: Mode,

    /// Task id for batch runs; scopes workspace, logs, and trajectory.
    #[arg(long = "task-id")]
    task_id: Option<String>,

    /// Runtime config YAML.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run directory receiving logs, trajectories, and workspaces.
    #[arg(long = "run-dir", default_value = "runs/latest")]
    run_dir: PathBuf,

    /// Optional file receiving the run result as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Uploader that defers credential reading to the first upload, so runs
/// without calculation tools never need the object-store environment.
struct LazyUploader {
    inner: OnceLock<Result<OssUploader, String>>,
}

impl LazyUploader {
    fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }
}

impl ObjectStore for LazyUploader {
    fn upload(&self, path: &Path) -> Result<String, AdaptorError> {
        let uploader = self
            .inner
            .get_or_init(|| OssUploader::from_env().map_err(|e| e.to_string()));
        match uploader {
            Ok(uploader) => uploader.upload(path),
            Err(e) => Err(AdaptorError::Credentials(e.clone())),
        }
    }
}

fn init_logging(run_dir: &RunDir) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_file = run_dir.log_file();
    let appender = tracing_appender::rolling::never(
        log_file.parent().unwrap_or_else(|| Path::new(".")),
        log_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "matforge.log".into()),
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    guard
}

fn fatal(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("matforge: {}", message);
    ExitCode::from(1)
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = config::load_and_apply("matforge", None) {
        return fatal(format!("environment loading failed: {}", e));
    }

    let runtime_config = if args.config.exists() {
        match config::runtime::RuntimeConfig::load(&args.config) {
            Ok(c) => c,
            Err(e) => return fatal(e),
        }
    } else {
        config::runtime::RuntimeConfig::default()
    };

    let run_dir = match RunDir::create(&args.run_dir, args.task_id.as_deref()) {
        Ok(r) => r,
        Err(e) => return fatal(format!("run dir: {}", e)),
    };
    let _log_guard = init_logging(&run_dir);
    if let Err(e) = run_dir.snapshot_config(&args.config) {
        tracing::warn!("config snapshot failed: {}", e);
    }
    tracing::info!("run directory: {}", run_dir.root().display());

    let sink = Arc::new(TrajectorySink::new());
    sink.set_path(run_dir.trajectory_file());

    let tool_loop = match ToolLoop::start() {
        Ok(l) => Arc::new(l),
        Err(e) => return fatal(e),
    };

    // Path adaptor for calculation servers, when configured.
    let adaptor = if runtime_config.mcp.path_adaptor.as_deref() == Some("calculation") {
        let executors = match runtime_config.mcp.calculation_executors.clone() {
            Some(value) => match serde_json::from_value(value) {
                Ok(executors) => executors,
                Err(e) => {
                    tracing::warn!("calculation_executors ignored: {}", e);
                    Default::default()
                }
            },
            None => Default::default(),
        };
        Some(Arc::new(PathAdaptor::new(
            executors,
            Arc::new(LazyUploader::new()),
        )))
    } else {
        None
    };

    let supervisor_config = SupervisorConfig {
        tool_include_only: runtime_config
            .mcp
            .tool_include_only
            .clone()
            .unwrap_or_default(),
        adaptor_servers: runtime_config
            .mcp
            .calculation_servers
            .clone()
            .map(|names| names.into_iter().collect::<HashSet<_>>()),
        workspace_root: run_dir.workspace(),
        call_deadline: None,
    };
    let supervisor = Arc::new(ServerSupervisor::new(
        Arc::clone(&tool_loop),
        supervisor_config,
        adaptor,
    ));
    let registry = Arc::new(ToolRegistry::new());
    supervisor.register_tools(&registry);

    if runtime_config.mcp.enabled.unwrap_or(true) {
        if let Some(config_file) = &runtime_config.mcp.config_file {
            let base = args.config.parent().unwrap_or_else(|| Path::new("."));
            let path = base.join(config_file);
            match config::servers::load_servers(&path, Some(&run_dir.workspaces_root())) {
                Ok(loaded) => {
                    for name in &loaded.skipped {
                        tracing::warn!("skipping invalid server config entry: {}", name);
                    }
                    for (name, entry) in loaded.servers {
                        let params = match entry {
                            config::servers::ServerEntry::Stdio { command, args, env } => {
                                matforge::TransportParams::Stdio(
                                    matforge::provider::StdioServerParams { command, args, env },
                                )
                            }
                            config::servers::ServerEntry::Remote { url, headers, .. } => {
                                matforge::TransportParams::Http(
                                    matforge::provider::HttpServerParams { url, headers },
                                )
                            }
                        };
                        if let Err(e) = supervisor.add_server_blocking(&name, params) {
                            tracing::error!("failed to add tool server '{}': {}", name, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("server config not loaded: {}", e),
            }
        }
    }

    // Skills, when enabled, ride along as one registry tool.
    let mut system_prompt = SYSTEM_PROMPT.to_string();
    if runtime_config.skills.enabled {
        let root = runtime_config
            .skills
            .skills_root
            .clone()
            .unwrap_or_else(|| "skills".into());
        match SkillRegistry::load(root) {
            Ok(skills) => {
                let skills = Arc::new(skills);
                tracing::info!("loaded {} skills", skills.len());
                system_prompt = format!("{}\n\n{}", system_prompt, skills.meta_context());
                let session = Arc::new(LocalSession::new(run_dir.workspace()));
                if let Err(e) = registry.register(Arc::new(UseSkillTool::new(skills, session))) {
                    tracing::warn!("skill tool not registered: {}", e);
                }
            }
            Err(e) => tracing::warn!("skill registry not loaded: {}", e),
        }
    }

    let llm = match matforge::OpenAiChat::from_env(&runtime_config.llm.model) {
        Ok(chat) => match runtime_config.llm.temperature {
            Some(t) => Arc::new(chat.with_temperature(t)),
            None => Arc::new(chat),
        },
        Err(e) => return fatal(e),
    };

    let agent_config = AgentConfig {
        max_turns: runtime_config.agent.max_turns,
        max_context_messages: runtime_config.agent.max_context_messages,
        ..AgentConfig::default()
    };
    let agent = AgentRuntime::new(
        "main",
        llm.clone(),
        Arc::clone(&registry),
        Arc::clone(&tool_loop),
        Arc::clone(&sink),
        system_prompt,
        agent_config,
    );
    let solver = DirectSolver::new(agent);

    let exit = match args.mode {
        Mode::Direct => run_direct(&solver, &args),
        Mode::Planner => run_planner(
            solver,
            llm,
            &registry,
            &tool_loop,
            &run_dir,
            &runtime_config,
            &args,
        ),
    };

    if let Err(e) = supervisor.cleanup_blocking() {
        tracing::warn!("cleanup: {}", e);
    }
    exit
}

fn write_output(args: &Args, value: &serde_json::Value) {
    if let Some(path) = &args.output {
        if let Err(e) = matforge::write_json_atomic(path, value) {
            tracing::warn!("result not written to {}: {}", path.display(), e);
        }
    }
}

fn run_direct(solver: &DirectSolver, args: &Args) -> ExitCode {
    match solver.solve(&args.task) {
        Ok(result) => {
            println!("{}", result.final_message);
            write_output(
                args,
                &serde_json::json!({
                    "status": result.status,
                    "final_message": result.final_message,
                    "turns": result.turns,
                }),
            );
            match result.status {
                RunStatus::Completed => ExitCode::SUCCESS,
                RunStatus::Aborted => ExitCode::from(2),
                _ => ExitCode::from(3),
            }
        }
        Err(e) => {
            tracing::error!("run failed: {}", e);
            ExitCode::from(3)
        }
    }
}

fn run_planner(
    solver: DirectSolver,
    llm: Arc<matforge::OpenAiChat>,
    registry: &Arc<ToolRegistry>,
    tool_loop: &Arc<ToolLoop>,
    run_dir: &RunDir,
    runtime_config: &config::runtime::RuntimeConfig,
    args: &Args,
) -> ExitCode {
    let planner_config = PlannerConfig {
        max_steps: runtime_config.planner.max_steps,
        hardware_has_gpu: runtime_config.planner.hardware_has_gpu,
        target_fidelity: if runtime_config
            .planner
            .target_fidelity
            .eq_ignore_ascii_case("production")
        {
            Fidelity::Production
        } else {
            Fidelity::Screening
        },
        ..PlannerConfig::default()
    };
    let mut engine = PlanExecuteEngine::new(
        llm,
        Arc::clone(tool_loop),
        Arc::clone(registry),
        solver,
        run_dir.clone(),
        Box::new(ConsoleGate),
        planner_config,
    );
    match engine.run(&args.task) {
        Ok(state) => {
            let complete = state.is_complete();
            write_output(
                args,
                &serde_json::json!({
                    "status": if complete { "completed" } else { "failed" },
                    "plan": state.plan,
                    "history": state.history,
                }),
            );
            if complete {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            }
        }
        Err(PlanError::Aborted) => {
            tracing::info!("aborted at the pre-flight gate");
            ExitCode::from(2)
        }
        Err(PlanError::Refused(reason)) => {
            eprintln!("plan refused: {}", reason);
            write_output(
                args,
                &serde_json::json!({"status": "refused", "reason": reason}),
            );
            ExitCode::from(3)
        }
        Err(e) => {
            tracing::error!("planner run failed: {}", e);
            ExitCode::from(3)
        }
    }
}
