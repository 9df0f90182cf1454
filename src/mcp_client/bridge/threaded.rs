//! Thread-isolated synchronous bridge.
//!
//! One dedicated OS thread runs a single-threaded Tokio runtime for the
//! lifetime of the bridge and owns the session manager. Synchronous callers
//! hand work to that runtime and block on the reply with a bounded wait.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::mcp_client::connection::Connector;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::StdioConnector;
use crate::mcp_client::manager::{SessionManager, ToolCachePolicy};
use crate::mcp_client::registry::ServerRegistry;
use crate::mcp_client::types::{ToolDescriptor, ToolResult};

/// Upper bound on a single submitted operation.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on `close`. Past this the worker thread is detached.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `start` waits for the worker runtime to come up.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace given to leftover tasks when the worker runtime is torn down.
const RUNTIME_TEARDOWN: Duration = Duration::from_millis(500);

struct WorkerControl {
    shutdown: oneshot::Sender<()>,
    done: std_mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

/// Synchronous bridge backed by a private runtime thread.
pub struct ThreadBridge {
    handle: Handle,
    manager: SessionManager,
    control: Mutex<Option<WorkerControl>>,
    closed: AtomicBool,
    call_timeout: Duration,
}

impl ThreadBridge {
    /// Start the worker thread with the in-process protocol client.
    pub fn start(registry: Arc<ServerRegistry>, policy: ToolCachePolicy) -> Result<Self, McpError> {
        Self::start_with(registry, StdioConnector, policy)
    }

    /// Start the worker thread with any connector.
    ///
    /// Blocks until the worker runtime is ready (bounded).
    pub fn start_with<C: Connector>(
        registry: Arc<ServerRegistry>,
        connector: C,
        policy: ToolCachePolicy,
    ) -> Result<Self, McpError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);

        let thread = std::thread::Builder::new()
            .name("mcp-bridge-worker".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to build runtime: {e}")));
                        return;
                    }
                };

                rt.block_on(async move {
                    let manager = SessionManager::spawn(registry, connector, policy);
                    if ready_tx.send(Ok((Handle::current(), manager.clone()))).is_err() {
                        return;
                    }
                    tracing::debug!("bridge worker ready");

                    // A dropped sender also means shut down.
                    let _ = shutdown_rx.await;
                    manager.close().await;
                });
                rt.shutdown_timeout(RUNTIME_TEARDOWN);
                let _ = done_tx.send(());
                tracing::debug!("bridge worker exited");
            })
            .map_err(|e| McpError::WorkerUnavailable {
                reason: format!("failed to spawn worker thread: {e}"),
            })?;

        let (handle, manager) = match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(ready)) => ready,
            Ok(Err(reason)) => return Err(McpError::WorkerUnavailable { reason }),
            Err(_) => {
                return Err(McpError::WorkerUnavailable {
                    reason: format!(
                        "worker thread not ready after {}s",
                        READY_TIMEOUT.as_secs()
                    ),
                })
            }
        };

        tracing::info!("thread-isolated bridge started");
        Ok(Self {
            handle,
            manager,
            control: Mutex::new(Some(WorkerControl {
                shutdown: shutdown_tx,
                done: done_rx,
                thread,
            })),
            closed: AtomicBool::new(false),
            call_timeout: CALL_TIMEOUT,
        })
    }

    /// Override the per-operation wait (default [`CALL_TIMEOUT`]).
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let name = server.to_string();
        self.submit(server, "list_tools", move |manager| async move {
            manager.list_tools(&name).await
        })
    }

    pub fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        let name = server.to_string();
        let tool_name = tool.to_string();
        self.submit(server, &format!("tools/call '{tool}'"), move |manager| async move {
            manager.call_tool(&name, &tool_name, arguments).await
        })
    }

    /// Run `op` on the worker runtime and block for its result.
    ///
    /// A timeout abandons the wait only; the operation keeps running on
    /// the worker.
    fn submit<T, F, Fut>(&self, server: &str, operation: &str, op: F) -> Result<T, McpError>
    where
        T: Send + 'static,
        F: FnOnce(SessionManager) -> Fut,
        Fut: Future<Output = Result<T, McpError>> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::WorkerUnavailable {
                reason: "bridge is closed".into(),
            });
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        let fut = op(self.manager.clone());
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });

        match rx.recv_timeout(self.call_timeout) {
            Ok(result) => result,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(McpError::Timeout {
                server: server.to_string(),
                operation: operation.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(McpError::WorkerUnavailable {
                reason: "worker runtime dropped the request".into(),
            }),
        }
    }

    /// Close every session and stop the worker thread.
    ///
    /// Bounded by [`SHUTDOWN_TIMEOUT`]; a worker that does not exit in time
    /// is left to finish on its own. Safe to call more than once.
    pub fn close(&self) {
        let control = match self.control.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(control) = control else {
            return;
        };
        self.closed.store(true, Ordering::SeqCst);

        tracing::info!("closing thread-isolated bridge");
        let _ = control.shutdown.send(());
        match control.done.recv_timeout(SHUTDOWN_TIMEOUT) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = control.thread.join();
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_s = SHUTDOWN_TIMEOUT.as_secs(),
                    "bridge worker did not stop in time, detaching"
                );
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadBridge {
    fn drop(&mut self) {
        // Signal only; the worker cleans up without being joined.
        if let Ok(mut guard) = self.control.lock() {
            if let Some(control) = guard.take() {
                let _ = control.shutdown.send(());
            }
        }
    }
}
