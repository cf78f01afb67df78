//! Tool server supervisor: lifecycle of all provider connections.
//!
//! One supervisor fiber per server runs on the tool loop. The fiber opens
//! the connection, lists tools, projects them into the bound registry under
//! `{server}_{tool}` names, then parks on the server's stop signal; every
//! exit path closes the connection. External code never reaches into a
//! connection — removal always goes through the stop signal.
//!
//! `add_server`, `remove_server`, and `cleanup` must run on the loop;
//! synchronous callers use the `*_blocking` wrappers, which submit through
//! the bridge.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::registry::Tool;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adaptor::PathAdaptor;
use crate::bridge::{SubmitError, ToolLoop};
use crate::provider::{ProviderConnection, TransportError, TransportParams};
use crate::registry::{RemoteToolAdapter, ToolRegistry};

/// Connection state of one managed server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Ready,
    Stopping,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server already exists: {0}")]
    AlreadyExists(String),
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("{0} must run on the tool loop; submit it through the bridge")]
    NotOnLoop(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Bridge(#[from] SubmitError),
    #[error("supervisor fiber ended unexpectedly for server: {0}")]
    FiberGone(String),
    #[error("cleanup incomplete; failed servers: {}", .0.join(", "))]
    Cleanup(Vec<String>),
}

/// Static settings applied to every server the supervisor manages.
#[derive(Default)]
pub struct SupervisorConfig {
    /// Per-server allowlist of remote tool names; servers absent from the
    /// map register everything.
    pub tool_include_only: HashMap<String, Vec<String>>,
    /// Servers whose calls go through the path adaptor. `None` applies the
    /// adaptor (when one is set) to every server.
    pub adaptor_servers: Option<HashSet<String>>,
    /// Workspace root handed to remote adapters for path resolution.
    pub workspace_root: PathBuf,
    /// Per-invocation deadline override for remote calls.
    pub call_deadline: Option<Duration>,
}

struct ServerEntry {
    state: ConnectionState,
    stop: CancellationToken,
    fiber: Option<JoinHandle<()>>,
    connection: Option<Arc<ProviderConnection>>,
    adapters: Vec<Arc<RemoteToolAdapter>>,
    tool_names: Vec<String>,
}

/// What a fiber hands back once its server is serving tools.
struct FiberReady {
    connection: Arc<ProviderConnection>,
    adapters: Vec<Arc<RemoteToolAdapter>>,
}

pub struct ServerSupervisor {
    tool_loop: Arc<ToolLoop>,
    config: SupervisorConfig,
    adaptor: Option<Arc<PathAdaptor>>,
    servers: DashMap<String, ServerEntry>,
    registry: StdMutex<Option<Arc<ToolRegistry>>>,
}

impl ServerSupervisor {
    pub fn new(
        tool_loop: Arc<ToolLoop>,
        config: SupervisorConfig,
        adaptor: Option<Arc<PathAdaptor>>,
    ) -> Self {
        Self {
            tool_loop,
            config,
            adaptor,
            servers: DashMap::new(),
            registry: StdMutex::new(None),
        }
    }

    pub fn tool_loop(&self) -> &Arc<ToolLoop> {
        &self.tool_loop
    }

    /// Binds the registry and projects every currently-ready server into it.
    /// Servers that become ready later project immediately (hot add).
    pub fn register_tools(&self, registry: &Arc<ToolRegistry>) {
        *self.registry.lock().unwrap() = Some(Arc::clone(registry));
        let mut count = 0usize;
        for entry in self.servers.iter() {
            if entry.state == ConnectionState::Ready {
                for adapter in &entry.adapters {
                    if registry.register(Arc::clone(adapter) as _).is_ok() {
                        count += 1;
                    }
                }
            }
        }
        tracing::info!("projected {} provider tools into registry", count);
    }

    pub fn server_state(&self, name: &str) -> Option<ConnectionState> {
        self.servers.get(name).map(|e| e.state)
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Qualified names of every tool currently served.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for entry in self.servers.iter() {
            names.extend(entry.tool_names.iter().cloned());
        }
        names.sort();
        names
    }

    fn adaptor_for(&self, server: &str) -> Option<Arc<PathAdaptor>> {
        let adaptor = self.adaptor.as_ref()?;
        match &self.config.adaptor_servers {
            Some(set) if !set.contains(server) => None,
            _ => Some(Arc::clone(adaptor)),
        }
    }

    /// Adds a server and waits until its tools are projected. Must run on
    /// the tool loop. On fiber failure before ready, the captured error is
    /// returned and all per-server state is purged.
    pub async fn add_server(
        &self,
        name: &str,
        params: TransportParams,
    ) -> Result<(), SupervisorError> {
        if !self.tool_loop.on_loop_thread() {
            return Err(SupervisorError::NotOnLoop("add_server"));
        }
        if self.servers.contains_key(name) {
            return Err(SupervisorError::AlreadyExists(name.to_string()));
        }
        tracing::info!("adding tool server: {}", name);

        let stop = CancellationToken::new();
        self.servers.insert(
            name.to_string(),
            ServerEntry {
                state: ConnectionState::Starting,
                stop: stop.clone(),
                fiber: None,
                connection: None,
                adapters: Vec::new(),
                tool_names: Vec::new(),
            },
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let fiber = tokio::spawn(run_server_fiber(
            name.to_string(),
            params,
            self.config.tool_include_only.get(name).cloned(),
            self.adaptor_for(name),
            self.config.workspace_root.clone(),
            self.config.call_deadline,
            Arc::clone(&self.tool_loop),
            stop,
            ready_tx,
        ));
        if let Some(mut entry) = self.servers.get_mut(name) {
            entry.fiber = Some(fiber);
        }

        let ready = match ready_rx.await {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                if let Some(mut entry) = self.servers.get_mut(name) {
                    entry.state = ConnectionState::Failed;
                }
                self.servers.remove(name);
                return Err(e.into());
            }
            Err(_) => {
                self.servers.remove(name);
                return Err(SupervisorError::FiberGone(name.to_string()));
            }
        };

        // Projection happens on the loop before add_server returns, so a
        // caller can never invoke a tool the registry has not seen.
        let registry = self.registry.lock().unwrap().clone();
        let mut tool_names = Vec::with_capacity(ready.adapters.len());
        for adapter in &ready.adapters {
            tool_names.push(adapter.name().to_string());
            if let Some(registry) = &registry {
                if let Err(e) = registry.register(Arc::clone(adapter) as _) {
                    tracing::warn!("skipping projection of {}: {}", adapter.name(), e);
                }
            }
        }

        if let Some(mut entry) = self.servers.get_mut(name) {
            entry.state = ConnectionState::Ready;
            entry.connection = Some(ready.connection);
            entry.adapters = ready.adapters;
            entry.tool_names = tool_names;
        }
        tracing::info!("tool server ready: {}", name);
        Ok(())
    }

    /// Signals the server's fiber to stop and awaits its clean exit. Tools
    /// leave the registry before the connection closes. Must run on the loop.
    pub async fn remove_server(&self, name: &str) -> Result<(), SupervisorError> {
        if !self.tool_loop.on_loop_thread() {
            return Err(SupervisorError::NotOnLoop("remove_server"));
        }
        let (stop, fiber, tool_names) = {
            let mut entry = self
                .servers
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            entry.state = ConnectionState::Stopping;
            (entry.stop.clone(), entry.fiber.take(), entry.tool_names.clone())
        };

        if let Some(registry) = self.registry.lock().unwrap().clone() {
            for tool in &tool_names {
                registry.unregister(tool);
            }
        }

        stop.cancel();
        if let Some(fiber) = fiber {
            let _ = fiber.await;
        }
        self.servers.remove(name);
        tracing::info!("removed tool server: {} ({} tools)", name, tool_names.len());
        Ok(())
    }

    /// Removes every server, best effort, then clears the registry binding.
    /// Per-server failures are collected; the remainder still cleans up.
    pub async fn cleanup(&self) -> Result<(), SupervisorError> {
        if !self.tool_loop.on_loop_thread() {
            return Err(SupervisorError::NotOnLoop("cleanup"));
        }
        let mut failed = Vec::new();
        for name in self.server_names() {
            if let Err(e) = self.remove_server(&name).await {
                tracing::warn!("cleanup of server '{}' failed: {}", name, e);
                failed.push(name);
            }
        }
        *self.registry.lock().unwrap() = None;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Cleanup(failed))
        }
    }

    /// Blocking wrapper for synchronous callers: submits `add_server` onto
    /// the loop. The deadline covers connect + list_tools + projection.
    pub fn add_server_blocking(
        self: &Arc<Self>,
        name: &str,
        params: TransportParams,
    ) -> Result<(), SupervisorError> {
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        self.tool_loop
            .submit(async move { supervisor.add_server(&name, params).await })?
    }

    pub fn remove_server_blocking(self: &Arc<Self>, name: &str) -> Result<(), SupervisorError> {
        let supervisor = Arc::clone(self);
        let name = name.to_string();
        self.tool_loop
            .submit(async move { supervisor.remove_server(&name).await })?
    }

    pub fn cleanup_blocking(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let supervisor = Arc::clone(self);
        self.tool_loop
            .submit(async move { supervisor.cleanup().await })?
    }
}

/// The per-server fiber. Scoped acquisition: the connection opened here is
/// closed on every exit path, including open/list failures and stop.
#[allow(clippy::too_many_arguments)]
async fn run_server_fiber(
    name: String,
    params: TransportParams,
    include_only: Option<Vec<String>>,
    adaptor: Option<Arc<PathAdaptor>>,
    workspace_root: PathBuf,
    call_deadline: Option<Duration>,
    tool_loop: Arc<ToolLoop>,
    stop: CancellationToken,
    ready_tx: oneshot::Sender<Result<FiberReady, TransportError>>,
) {
    let connection = match ProviderConnection::open(&params).await {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let tools = match connection.list_tools().await {
        Ok(tools) => tools,
        Err(e) => {
            connection.close().await;
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let total = tools.len();
    let tools: Vec<_> = match &include_only {
        Some(allow) => tools
            .into_iter()
            .filter(|t| allow.iter().any(|a| a == &t.name))
            .collect(),
        None => tools,
    };
    if include_only.is_some() {
        tracing::info!(
            "server '{}': {} of {} tools pass the allowlist",
            name,
            tools.len(),
            total
        );
    }

    let adapters: Vec<Arc<RemoteToolAdapter>> = tools
        .into_iter()
        .map(|remote| {
            let adapter = RemoteToolAdapter::new(
                &name,
                remote,
                Arc::clone(&connection),
                Arc::clone(&tool_loop),
                adaptor.clone(),
                workspace_root.clone(),
            );
            let adapter = match call_deadline {
                Some(d) => adapter.with_deadline(d),
                None => adapter,
            };
            Arc::new(adapter)
        })
        .collect();

    if ready_tx
        .send(Ok(FiberReady {
            connection: Arc::clone(&connection),
            adapters,
        }))
        .is_err()
    {
        // add_server vanished; unwind the acquisition and leave.
        connection.close().await;
        return;
    }

    stop.cancelled().await;
    connection.close().await;
    tracing::debug!("server fiber exited: {}", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testutil::{fake_provider_script, serve_fake_provider, sh_params};
    use crate::provider::HttpServerParams;
    use std::collections::HashMap;

    fn new_supervisor(config: SupervisorConfig) -> (Arc<ServerSupervisor>, Arc<ToolRegistry>) {
        let tool_loop = Arc::new(ToolLoop::start().unwrap());
        let supervisor = Arc::new(ServerSupervisor::new(tool_loop, config, None));
        let registry = Arc::new(ToolRegistry::new());
        (supervisor, registry)
    }

    fn stdio_params(dir: &std::path::Path) -> TransportParams {
        TransportParams::Stdio(sh_params(&fake_provider_script(dir)))
    }

    #[test]
    fn stdio_add_then_remove_restores_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, registry) = new_supervisor(SupervisorConfig::default());
        supervisor.register_tools(&registry);

        supervisor
            .add_server_blocking("s", stdio_params(dir.path()))
            .unwrap();
        assert_eq!(registry.names(), vec!["s_a".to_string(), "s_b".to_string()]);
        assert_eq!(
            supervisor.server_state("s"),
            Some(ConnectionState::Ready)
        );

        supervisor.remove_server_blocking("s").unwrap();
        assert!(registry.is_empty());
        assert!(supervisor.server_state("s").is_none());
    }

    #[test]
    fn invoke_remote_tool_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, registry) = new_supervisor(SupervisorConfig::default());
        supervisor.register_tools(&registry);
        supervisor
            .add_server_blocking("s", stdio_params(dir.path()))
            .unwrap();

        let (obs, meta) = registry.invoke("s_a", "{}").unwrap();
        assert_eq!(obs, "ok-a");
        assert_eq!(meta.origin_server.as_deref(), Some("s"));

        // The failing tool surfaces as a typed error, not a crash.
        let err = registry.invoke("s_b", "{}").unwrap_err();
        assert_eq!(err.kind(), "transport");

        supervisor.cleanup_blocking().unwrap();
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, registry) = new_supervisor(SupervisorConfig::default());
        supervisor.register_tools(&registry);
        supervisor
            .add_server_blocking("s", stdio_params(dir.path()))
            .unwrap();
        let err = supervisor
            .add_server_blocking("s", stdio_params(dir.path()))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyExists(_)));
        supervisor.cleanup_blocking().unwrap();
    }

    #[test]
    fn failed_open_purges_state_and_registry_is_untouched() {
        let (supervisor, registry) = new_supervisor(SupervisorConfig::default());
        supervisor.register_tools(&registry);
        let params = TransportParams::Stdio(crate::provider::StdioServerParams {
            command: "_matforge_no_such_command_xyz_".into(),
            args: vec![],
            env: HashMap::new(),
        });
        let err = supervisor.add_server_blocking("bad", params).unwrap_err();
        assert!(matches!(err, SupervisorError::Transport(_)));
        assert!(supervisor.server_names().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn hot_add_projects_into_already_bound_registry() {
        let (supervisor, registry) = new_supervisor(SupervisorConfig::default());
        // Bind first, add later: the new server's tools appear immediately.
        supervisor.register_tools(&registry);

        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let server = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                serve_fake_provider(listener, 3).await;
            });
        });
        let addr = addr_rx.recv().unwrap();

        supervisor
            .add_server_blocking(
                "web",
                TransportParams::Http(HttpServerParams {
                    url: format!("http://{}", addr),
                    headers: HashMap::new(),
                }),
            )
            .unwrap();
        assert_eq!(registry.names(), vec!["web_remote_a".to_string()]);
        assert_eq!(supervisor.tool_names(), vec!["web_remote_a".to_string()]);

        supervisor.remove_server_blocking("web").unwrap();
        assert!(registry.is_empty());
        server.join().unwrap();
    }

    #[test]
    fn allowlist_filters_projected_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SupervisorConfig::default();
        config
            .tool_include_only
            .insert("s".into(), vec!["a".into()]);
        let (supervisor, registry) = new_supervisor(config);
        supervisor.register_tools(&registry);
        supervisor
            .add_server_blocking("s", stdio_params(dir.path()))
            .unwrap();
        assert_eq!(registry.names(), vec!["s_a".to_string()]);
        supervisor.cleanup_blocking().unwrap();
    }

    #[test]
    fn cleanup_removes_every_server_and_unbinds() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, registry) = new_supervisor(SupervisorConfig::default());
        supervisor.register_tools(&registry);
        supervisor
            .add_server_blocking("s1", stdio_params(dir.path()))
            .unwrap();
        supervisor
            .add_server_blocking("s2", stdio_params(dir.path()))
            .unwrap();
        assert_eq!(registry.len(), 4);

        supervisor.cleanup_blocking().unwrap();
        assert!(registry.is_empty());
        assert!(supervisor.server_names().is_empty());
    }

    #[test]
    fn slow_call_times_out_while_another_server_stays_responsive() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SupervisorConfig::default();
        config.call_deadline = Some(Duration::from_millis(300));
        let (supervisor, registry) = new_supervisor(config);
        supervisor.register_tools(&registry);

        let slow = crate::provider::testutil::slow_provider_script(dir.path(), 3);
        supervisor
            .add_server_blocking("s1", TransportParams::Stdio(sh_params(&slow)))
            .unwrap();
        supervisor
            .add_server_blocking("s2", stdio_params(dir.path()))
            .unwrap();

        let started = std::time::Instant::now();
        let err = registry.invoke("s1_slow", "{}").unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(2));

        // The blocked call lives on the loop, not on the other server's
        // connection; an unrelated tool answers normally.
        let (obs, _) = registry.invoke("s2_a", "{}").unwrap();
        assert_eq!(obs, "ok-a");

        supervisor.cleanup_blocking().unwrap();
    }

    #[test]
    fn loop_only_operations_reject_direct_calls() {
        let (supervisor, _registry) = new_supervisor(SupervisorConfig::default());
        let err = futures::executor::block_on(supervisor.remove_server("nope")).unwrap_err();
        assert!(matches!(err, SupervisorError::NotOnLoop(_)));
    }
}
