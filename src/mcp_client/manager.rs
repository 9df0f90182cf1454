//! Session manager: one lazily created session per named server.
//!
//! Ownership is structural rather than lock-based:
//! - A manager task owns the map of server workers. Handles talk to it
//!   only through [`ManagerCommand`] messages.
//! - Each server gets its own worker task that owns that server's
//!   connection and tool cache and processes commands one at a time. Calls
//!   to one server are serialized; calls to different servers run
//!   concurrently, and a hung server only stalls its own queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::connection::{Connector, ToolServerConnection};
use super::errors::McpError;
use super::registry::ServerRegistry;
use super::types::{ServerSpec, ToolDescriptor, ToolResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Capacity of the manager's command queue.
const MANAGER_QUEUE_DEPTH: usize = 64;

/// How long `close` waits for a server worker before aborting it.
///
/// Aborting drops the connection, which kills the child process.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(4);

// ─── Tool Cache Policy ───────────────────────────────────────────────────────

/// Whether `list_tools` results are kept until `close`/invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCachePolicy {
    /// First listing is cached per server; later listings do no I/O.
    Cache,
    /// Every listing goes to the server.
    Refetch,
}

// ─── Commands ────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, McpError>>;

enum ManagerCommand {
    EnsureSession {
        server: String,
        reply: Reply<()>,
    },
    ListTools {
        server: String,
        reply: Reply<Vec<ToolDescriptor>>,
    },
    CallTool {
        server: String,
        tool: String,
        arguments: serde_json::Value,
        reply: Reply<ToolResult>,
    },
    InvalidateTools {
        server: String,
        reply: oneshot::Sender<()>,
    },
    ActiveServers {
        reply: oneshot::Sender<Vec<String>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum ServerCommand {
    Connect {
        reply: Reply<()>,
    },
    ListTools {
        reply: Reply<Vec<ToolDescriptor>>,
    },
    CallTool {
        tool: String,
        arguments: serde_json::Value,
        reply: Reply<ToolResult>,
    },
    InvalidateTools {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl ServerCommand {
    /// Answer a command that could not be delivered.
    fn fail(self, err: McpError) {
        match self {
            ServerCommand::Connect { reply } => {
                let _ = reply.send(Err(err));
            }
            ServerCommand::ListTools { reply } => {
                let _ = reply.send(Err(err));
            }
            ServerCommand::CallTool { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            ServerCommand::InvalidateTools { reply } | ServerCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Handle to the manager task. Cheap to clone; all clones share sessions.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<ManagerCommand>,
}

impl SessionManager {
    /// Spawn the manager task on the current Tokio runtime.
    pub fn spawn<C: Connector>(
        registry: Arc<ServerRegistry>,
        connector: C,
        policy: ToolCachePolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MANAGER_QUEUE_DEPTH);
        tokio::spawn(run_manager(registry, Arc::new(connector), policy, rx));
        Self { tx }
    }

    /// Make sure the server has a live, initialized session.
    ///
    /// Spawns and handshakes on first use, or after the process has exited.
    pub async fn ensure_session(&self, server: &str) -> Result<(), McpError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::EnsureSession {
            server: server.to_string(),
            reply,
        })
        .await?;
        rx.await.unwrap_or_else(|_| Err(dropped()))
    }

    /// List tools on a server (cache-first under [`ToolCachePolicy::Cache`]).
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::ListTools {
            server: server.to_string(),
            reply,
        })
        .await?;
        rx.await.unwrap_or_else(|_| Err(dropped()))
    }

    /// Call a tool. Never cached; bounded by the server's timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::CallTool {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
            reply,
        })
        .await?;
        rx.await.unwrap_or_else(|_| Err(dropped()))
    }

    /// Drop the cached tool listing for one server.
    pub async fn invalidate_tools(&self, server: &str) -> Result<(), McpError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::InvalidateTools {
            server: server.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| dropped())
    }

    /// Servers that currently have a worker (sorted).
    pub async fn active_servers(&self) -> Result<Vec<String>, McpError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::ActiveServers { reply }).await?;
        rx.await.map_err(|_| dropped())
    }

    /// Shut down every session and clear every cache.
    ///
    /// The manager keeps running: later calls create sessions again.
    /// Closing an already-closed manager is a no-op.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(ManagerCommand::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: ManagerCommand) -> Result<(), McpError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| McpError::WorkerUnavailable {
                reason: "session manager has stopped".into(),
            })
    }
}

fn dropped() -> McpError {
    McpError::WorkerUnavailable {
        reason: "session worker dropped the request".into(),
    }
}

// ─── Manager Task ────────────────────────────────────────────────────────────

struct ServerWorker {
    tx: UnboundedSender<ServerCommand>,
    task: JoinHandle<()>,
}

async fn run_manager<C: Connector>(
    registry: Arc<ServerRegistry>,
    connector: Arc<C>,
    policy: ToolCachePolicy,
    mut rx: mpsc::Receiver<ManagerCommand>,
) {
    let mut workers: HashMap<String, ServerWorker> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            ManagerCommand::EnsureSession { server, reply } => {
                dispatch(
                    &mut workers,
                    &registry,
                    &connector,
                    policy,
                    &server,
                    ServerCommand::Connect { reply },
                );
            }
            ManagerCommand::ListTools { server, reply } => {
                dispatch(
                    &mut workers,
                    &registry,
                    &connector,
                    policy,
                    &server,
                    ServerCommand::ListTools { reply },
                );
            }
            ManagerCommand::CallTool {
                server,
                tool,
                arguments,
                reply,
            } => {
                dispatch(
                    &mut workers,
                    &registry,
                    &connector,
                    policy,
                    &server,
                    ServerCommand::CallTool {
                        tool,
                        arguments,
                        reply,
                    },
                );
            }
            ManagerCommand::InvalidateTools { server, reply } => match workers.get(&server) {
                Some(worker) => {
                    if let Err(mpsc::error::SendError(cmd)) =
                        worker.tx.send(ServerCommand::InvalidateTools { reply })
                    {
                        cmd.fail(dropped());
                    }
                }
                // No worker means no cache.
                None => {
                    let _ = reply.send(());
                }
            },
            ManagerCommand::ActiveServers { reply } => {
                let mut names: Vec<String> = workers
                    .iter()
                    .filter(|(_, w)| !w.task.is_finished())
                    .map(|(name, _)| name.clone())
                    .collect();
                names.sort();
                let _ = reply.send(names);
            }
            ManagerCommand::Close { reply } => {
                close_workers(&mut workers).await;
                let _ = reply.send(());
            }
        }
    }

    // Every handle is gone.
    close_workers(&mut workers).await;
}

/// Route a command to the server's worker, creating the worker on first use.
fn dispatch<C: Connector>(
    workers: &mut HashMap<String, ServerWorker>,
    registry: &ServerRegistry,
    connector: &Arc<C>,
    policy: ToolCachePolicy,
    server: &str,
    cmd: ServerCommand,
) {
    if workers.get(server).is_some_and(|w| w.tx.is_closed()) {
        tracing::warn!(server, "server worker stopped unexpectedly, replacing it");
        workers.remove(server);
    }

    if !workers.contains_key(server) {
        let Some(spec) = registry.get(server) else {
            cmd.fail(McpError::ServerNotFound {
                name: server.to_string(),
            });
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_server_worker(
            spec.clone(),
            Arc::clone(connector),
            policy,
            rx,
        ));
        workers.insert(server.to_string(), ServerWorker { tx, task });
    }

    if let Some(worker) = workers.get(server) {
        if let Err(mpsc::error::SendError(cmd)) = worker.tx.send(cmd) {
            cmd.fail(dropped());
        }
    }
}

/// Shut every worker down concurrently; abort the ones that do not finish.
async fn close_workers(workers: &mut HashMap<String, ServerWorker>) {
    if workers.is_empty() {
        return;
    }
    tracing::info!(count = workers.len(), "closing sessions");

    let shutdowns = workers.drain().map(|(name, worker)| async move {
        let (reply, ack) = oneshot::channel();
        if worker.tx.send(ServerCommand::Shutdown { reply }).is_err() {
            return;
        }
        if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, ack).await.is_err() {
            tracing::warn!(server = %name, "server worker did not stop in time, aborting");
            worker.task.abort();
        }
    });
    futures::future::join_all(shutdowns).await;
}

// ─── Server Worker ───────────────────────────────────────────────────────────

/// Owns one server's connection and tool cache.
async fn run_server_worker<C: Connector>(
    spec: ServerSpec,
    connector: Arc<C>,
    policy: ToolCachePolicy,
    mut rx: UnboundedReceiver<ServerCommand>,
) {
    let mut conn: Option<C::Connection> = None;
    let mut tools: Option<Vec<ToolDescriptor>> = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            ServerCommand::Connect { reply } => {
                let result = ensure_connected(&spec, connector.as_ref(), &mut conn)
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            ServerCommand::ListTools { reply } => {
                if let Some(cached) = tools.as_ref().filter(|_| policy == ToolCachePolicy::Cache) {
                    tracing::debug!(server = %spec.name, "list_tools cache hit");
                    let _ = reply.send(Ok(cached.clone()));
                    continue;
                }

                tracing::debug!(server = %spec.name, "list_tools cache miss, fetching");
                let result = match ensure_connected(&spec, connector.as_ref(), &mut conn).await {
                    Ok(c) => c.list_tools(spec.timeout).await,
                    Err(e) => Err(e),
                };
                if let (Ok(listing), ToolCachePolicy::Cache) = (&result, policy) {
                    tools = Some(listing.clone());
                }
                let _ = reply.send(result);
            }
            ServerCommand::CallTool {
                tool,
                arguments,
                reply,
            } => {
                let start = Instant::now();
                tracing::info!(server = %spec.name, tool = %tool, "calling tool");
                let result = match ensure_connected(&spec, connector.as_ref(), &mut conn).await {
                    Ok(c) => c.call_tool(&tool, arguments, spec.timeout).await,
                    Err(e) => Err(e),
                };
                let elapsed_ms = start.elapsed().as_millis() as u64;
                match &result {
                    Ok(r) => tracing::info!(
                        server = %spec.name,
                        tool = %tool,
                        elapsed_ms,
                        items = r.content_items.len(),
                        "tool call complete"
                    ),
                    Err(e) => tracing::warn!(
                        server = %spec.name,
                        tool = %tool,
                        elapsed_ms,
                        error = %e,
                        "tool call failed"
                    ),
                }
                let _ = reply.send(result);
            }
            ServerCommand::InvalidateTools { reply } => {
                tools = None;
                let _ = reply.send(());
            }
            ServerCommand::Shutdown { reply } => {
                if let Some(mut c) = conn.take() {
                    c.shutdown().await;
                }
                let _ = reply.send(());
                return;
            }
        }
    }

    if let Some(mut c) = conn.take() {
        c.shutdown().await;
    }
}

/// Return the live connection, respawning it if the process has exited.
async fn ensure_connected<'a, C: Connector>(
    spec: &ServerSpec,
    connector: &C,
    conn: &'a mut Option<C::Connection>,
) -> Result<&'a mut C::Connection, McpError> {
    if conn.as_mut().map(|c| c.is_alive()) == Some(false) {
        tracing::warn!(server = %spec.name, "server process exited, respawning");
        *conn = None;
    }

    if conn.is_none() {
        *conn = Some(connector.connect(spec).await?);
    }

    conn.as_mut().ok_or_else(|| McpError::ConnectionFailed {
        name: spec.name.clone(),
        reason: "connection unavailable after connect".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp_client::types::ContentItem;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counters shared between a [`MockConnector`] and the test.
    #[derive(Default)]
    pub(crate) struct MockStats {
        pub connects: AtomicUsize,
        pub list_calls: AtomicUsize,
        pub tool_calls: AtomicUsize,
        pub shutdowns: AtomicUsize,
        /// Makes the next live connection report itself dead once.
        pub crash_next: AtomicBool,
    }

    /// In-memory connector. Tool behaviour is keyed by tool name:
    /// `hang` never answers, `slow` sleeps 300ms, anything else echoes
    /// `"<server>:<tool>"`.
    #[derive(Clone)]
    pub(crate) struct MockConnector {
        pub stats: Arc<MockStats>,
        pub fail_connect: bool,
    }

    pub(crate) struct MockConnection {
        server: String,
        stats: Arc<MockStats>,
        alive: bool,
    }

    #[async_trait]
    impl ToolServerConnection for MockConnection {
        fn is_alive(&mut self) -> bool {
            if self.stats.crash_next.swap(false, Ordering::SeqCst) {
                self.alive = false;
            }
            self.alive
        }

        async fn list_tools(&mut self, _timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
            self.stats.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ToolDescriptor {
                name: "echo".into(),
                description: "Echo".into(),
                input_schema: serde_json::json!({"type": "object"}),
                server_name: self.server.clone(),
            }])
        }

        async fn call_tool(
            &mut self,
            tool: &str,
            _arguments: serde_json::Value,
            timeout: Duration,
        ) -> Result<ToolResult, McpError> {
            self.stats.tool_calls.fetch_add(1, Ordering::SeqCst);
            let delay = match tool {
                "hang" => Duration::from_secs(3600),
                "slow" => Duration::from_millis(300),
                _ => Duration::ZERO,
            };
            tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .map_err(|_| McpError::Timeout {
                    server: self.server.clone(),
                    operation: format!("tools/call '{tool}'"),
                    timeout_ms: timeout.as_millis() as u64,
                })?;
            Ok(ToolResult {
                metadata: serde_json::Map::new(),
                content_items: vec![ContentItem::text(format!("{}:{tool}", self.server))],
            })
        }

        async fn shutdown(&mut self) {
            self.alive = false;
            self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Connection = MockConnection;

        async fn connect(&self, spec: &ServerSpec) -> Result<MockConnection, McpError> {
            self.stats.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(McpError::ConnectionFailed {
                    name: spec.name.clone(),
                    reason: "mock refused".into(),
                });
            }
            Ok(MockConnection {
                server: spec.name.clone(),
                stats: Arc::clone(&self.stats),
                alive: true,
            })
        }
    }

    pub(crate) fn registry() -> Arc<ServerRegistry> {
        Arc::new(ServerRegistry::from_specs([
            ServerSpec::new("alpha", "mock", &[]).with_timeout(Duration::from_millis(200)),
            ServerSpec::new("beta", "mock", &[]).with_timeout(Duration::from_secs(5)),
        ]))
    }

    fn manager(policy: ToolCachePolicy) -> (SessionManager, Arc<MockStats>) {
        let stats = Arc::new(MockStats::default());
        let connector = MockConnector {
            stats: Arc::clone(&stats),
            fail_connect: false,
        };
        (SessionManager::spawn(registry(), connector, policy), stats)
    }

    #[tokio::test]
    async fn test_unknown_server_never_connects() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        let err = mgr.list_tools("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
        let err = mgr
            .call_tool("ghost", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
        assert_eq!(stats.connects.load(Ordering::SeqCst), 0);
        assert!(mgr.active_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_session_connects_once() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        mgr.ensure_session("beta").await.unwrap();
        mgr.ensure_session("beta").await.unwrap();
        mgr.call_tool("beta", "echo", serde_json::json!({})).await.unwrap();
        assert_eq!(stats.connects.load(Ordering::SeqCst), 1);

        let err = mgr.ensure_session("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_session_is_created_once_and_reused() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        for _ in 0..3 {
            mgr.call_tool("beta", "echo", serde_json::json!({})).await.unwrap();
        }
        assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.tool_calls.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.active_servers().await.unwrap(), vec!["beta"]);
    }

    #[tokio::test]
    async fn test_list_tools_cached_until_close() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        let first = mgr.list_tools("beta").await.unwrap();
        let second = mgr.list_tools("beta").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].server_name, "beta");
        assert_eq!(stats.list_calls.load(Ordering::SeqCst), 1);

        mgr.close().await;
        mgr.list_tools("beta").await.unwrap();
        assert_eq!(stats.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refetch_policy_always_lists() {
        let (mgr, stats) = manager(ToolCachePolicy::Refetch);
        mgr.list_tools("beta").await.unwrap();
        mgr.list_tools("beta").await.unwrap();
        assert_eq!(stats.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_tools_forces_refetch() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        mgr.list_tools("beta").await.unwrap();
        mgr.invalidate_tools("beta").await.unwrap();
        mgr.invalidate_tools("alpha").await.unwrap();
        mgr.list_tools("beta").await.unwrap();
        assert_eq!(stats.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_usable() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        let err = mgr
            .call_tool("alpha", "slow", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let ok = mgr.call_tool("alpha", "echo", serde_json::json!({})).await.unwrap();
        assert_eq!(ok.first_text(), Some("alpha:echo"));
        assert_eq!(stats.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_server_does_not_block_other_server() {
        let (mgr, _stats) = manager(ToolCachePolicy::Cache);

        let hung = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.call_tool("beta", "hang", serde_json::json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        let ok = mgr.call_tool("alpha", "echo", serde_json::json!({})).await.unwrap();
        assert_eq!(ok.first_text(), Some("alpha:echo"));
        assert!(start.elapsed() < Duration::from_secs(1));

        let result = hung.await.unwrap();
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_crashed_process_is_respawned() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        mgr.call_tool("beta", "echo", serde_json::json!({})).await.unwrap();
        stats.crash_next.store(true, Ordering::SeqCst);
        mgr.call_tool("beta", "echo", serde_json::json!({})).await.unwrap();
        assert_eq!(stats.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_retried_on_next_call() {
        let stats = Arc::new(MockStats::default());
        let connector = MockConnector {
            stats: Arc::clone(&stats),
            fail_connect: true,
        };
        let mgr = SessionManager::spawn(registry(), connector, ToolCachePolicy::Cache);
        for _ in 0..2 {
            let err = mgr.list_tools("beta").await.unwrap_err();
            assert!(matches!(err, McpError::ConnectionFailed { .. }));
        }
        assert_eq!(stats.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_shuts_sessions_down() {
        let (mgr, stats) = manager(ToolCachePolicy::Cache);
        mgr.call_tool("alpha", "echo", serde_json::json!({})).await.unwrap();
        mgr.call_tool("beta", "echo", serde_json::json!({})).await.unwrap();

        mgr.close().await;
        mgr.close().await;

        assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 2);
        assert!(mgr.active_servers().await.unwrap().is_empty());
    }
}
