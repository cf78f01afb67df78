//! Concurrency bridge: one long-lived cooperative event loop shared by all
//! tool-provider I/O, with thread-safe submission from synchronous callers.
//!
//! Provider transports use cancellation scopes and pipe state that are bound
//! to the task and loop that created them; running a fresh event loop per
//! call corrupts subprocess pipes. The bridge therefore owns a single
//! current-thread runtime on a dedicated OS thread, created once and living
//! for the lifetime of the supervisor. `submit` is the only path from a
//! synchronous caller onto that loop.

use std::future::Future;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tokio::runtime::Handle;

/// Default deadline for synchronous submissions.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Errors surfaced to synchronous callers of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Deadline expired. The in-loop task keeps running to completion; only
    /// the caller's wait is abandoned.
    #[error("tool loop submission timed out after {0:?}")]
    Timeout(Duration),
    /// The loop thread is gone (shutdown or panic); nothing will complete.
    #[error("tool loop is not running")]
    LoopGone,
    /// `submit` called from the loop thread itself; blocking there would
    /// deadlock the loop.
    #[error("submit called from the tool loop thread")]
    OnLoopThread,
    #[error("failed to start tool loop: {0}")]
    Start(String),
}

/// Handle to the long-lived tool loop.
///
/// Created once per process (by the CLI or an embedding application) and
/// shared as `Arc<ToolLoop>` by the supervisor, the remote tool adapters, and
/// the agent runtime. Dropping the handle shuts the loop down; in-flight
/// tasks are not awaited past shutdown.
pub struct ToolLoop {
    handle: Handle,
    loop_thread: ThreadId,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ToolLoop {
    /// Spawns the loop thread and blocks until its runtime is ready.
    pub fn start() -> Result<Self, SubmitError> {
        let (ready_tx, ready_rx) =
            crossbeam_channel::bounded::<Result<(Handle, ThreadId), String>>(1);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let join = thread::Builder::new()
            .name("matforge-tool-loop".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((runtime.handle().clone(), thread::current().id())));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .map_err(|e| SubmitError::Start(e.to_string()))?;

        let (handle, loop_thread) = ready_rx
            .recv()
            .map_err(|_| SubmitError::Start("loop thread exited before ready".into()))?
            .map_err(SubmitError::Start)?;

        tracing::debug!("tool loop started on {:?}", loop_thread);
        Ok(Self {
            handle,
            loop_thread,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    /// True when the current thread is the loop thread. Supervisor operations
    /// that must run on the loop assert with this.
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// Runs `future` on the loop and blocks the calling thread for the result
    /// with the default 60 s deadline.
    pub fn submit<F, T>(&self, future: F) -> Result<T, SubmitError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_deadline(future, DEFAULT_DEADLINE)
    }

    /// Runs `future` on the loop and blocks for the result until `deadline`.
    ///
    /// On expiry the caller gets `SubmitError::Timeout` while the in-loop
    /// task continues; the result is dropped when it completes. Submissions
    /// from one caller thread are enqueued in order.
    pub fn submit_with_deadline<F, T>(&self, future: F, deadline: Duration) -> Result<T, SubmitError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.on_loop_thread() {
            return Err(SubmitError::OnLoopThread);
        }
        let (tx, rx) = crossbeam_channel::bounded::<T>(1);
        self.handle.spawn(async move {
            let out = future.await;
            // Receiver may be gone after a timeout; the send result is moot.
            let _ = tx.send(out);
        });
        rx.recv_timeout(deadline).map_err(|e| match e {
            RecvTimeoutError::Timeout => SubmitError::Timeout(deadline),
            RecvTimeoutError::Disconnected => SubmitError::LoopGone,
        })
    }

    /// Fire-and-forget spawn onto the loop (used by the supervisor for
    /// per-server fibers). Callable from any thread.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Stops the loop and joins its thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ToolLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
