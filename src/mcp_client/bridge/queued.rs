//! Queue-based thread-safe bridge.
//!
//! A persistent worker thread consumes [`PendingRequest`]s from a request
//! queue and publishes each reply on a shared [`ResponseBoard`] under the
//! request's id. Any number of caller threads may submit at once; each one
//! blocks only on its own id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use uuid::Uuid;

use crate::mcp_client::connection::Connector;
use crate::mcp_client::correlator::ResponseBoard;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::StdioConnector;
use crate::mcp_client::manager::{SessionManager, ToolCachePolicy};
use crate::mcp_client::registry::ServerRegistry;
use crate::mcp_client::types::{ToolDescriptor, ToolResult};

/// How long a caller waits for its reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on `close`.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long construction waits for the worker's init handshake.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

const RUNTIME_TEARDOWN: Duration = Duration::from_millis(500);

/// Id under which the worker announces readiness.
const READY_ID: Uuid = Uuid::nil();

// ─── Queue Messages ──────────────────────────────────────────────────────────

#[derive(Debug)]
enum Method {
    ListTools {
        server: String,
    },
    CallTool {
        server: String,
        tool: String,
        arguments: serde_json::Value,
    },
    Close,
}

/// One enqueued operation, consumed exactly once by the worker.
#[derive(Debug)]
struct PendingRequest {
    id: Uuid,
    method: Method,
}

#[derive(Debug)]
enum Reply {
    Ready,
    Tools(Vec<ToolDescriptor>),
    Called(ToolResult),
    Closed,
}

type Board = ResponseBoard<Uuid, Result<Reply, McpError>>;

// ─── QueueBridge ─────────────────────────────────────────────────────────────

/// Thread-safe bridge; share it across caller threads behind an `Arc`.
///
/// Dropping it without `close` closes the request queue, which ends the
/// worker loop; sessions are dropped with the worker runtime.
pub struct QueueBridge {
    requests: UnboundedSender<PendingRequest>,
    board: Arc<Board>,
    worker: Mutex<Option<(std_mpsc::Receiver<()>, JoinHandle<()>)>>,
    closed: AtomicBool,
    response_timeout: Duration,
}

impl QueueBridge {
    /// Start the worker with the in-process protocol client.
    pub fn start(registry: Arc<ServerRegistry>, policy: ToolCachePolicy) -> Result<Self, McpError> {
        Self::start_with(registry, StdioConnector, policy)
    }

    /// Start the worker with any connector and wait for its init handshake.
    pub fn start_with<C: Connector>(
        registry: Arc<ServerRegistry>,
        connector: C,
        policy: ToolCachePolicy,
    ) -> Result<Self, McpError> {
        let board: Arc<Board> = Arc::new(ResponseBoard::new());
        let (requests, mut queue) = unbounded_channel::<PendingRequest>();
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);

        let worker_board = Arc::clone(&board);
        let thread = std::thread::Builder::new()
            .name("mcp-queue-worker".into())
            .spawn(move || {
                let board = worker_board;
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        board.publish(
                            READY_ID,
                            Err(McpError::WorkerUnavailable {
                                reason: format!("failed to build runtime: {e}"),
                            }),
                        );
                        return;
                    }
                };

                rt.block_on(async {
                    let manager = SessionManager::spawn(registry, connector, policy);
                    board.publish(READY_ID, Ok(Reply::Ready));

                    while let Some(request) = queue.recv().await {
                        tracing::debug!(id = %request.id, method = ?request.method, "dequeued request");
                        match request.method {
                            Method::Close => {
                                manager.close().await;
                                board.publish(request.id, Ok(Reply::Closed));
                                break;
                            }
                            method => {
                                let manager = manager.clone();
                                let board = Arc::clone(&board);
                                tokio::spawn(async move {
                                    let reply = match method {
                                        Method::ListTools { server } => {
                                            manager.list_tools(&server).await.map(Reply::Tools)
                                        }
                                        Method::CallTool {
                                            server,
                                            tool,
                                            arguments,
                                        } => manager
                                            .call_tool(&server, &tool, arguments)
                                            .await
                                            .map(Reply::Called),
                                        Method::Close => Ok(Reply::Closed),
                                    };
                                    if !board.publish(request.id, reply) {
                                        tracing::debug!(id = %request.id, "dropping reply, caller gave up");
                                    }
                                });
                            }
                        }
                    }
                });
                rt.shutdown_timeout(RUNTIME_TEARDOWN);
                let _ = done_tx.send(());
            })
            .map_err(|e| McpError::WorkerUnavailable {
                reason: format!("failed to spawn worker thread: {e}"),
            })?;

        match board.wait_for(&READY_ID, READY_TIMEOUT) {
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
            None => {
                return Err(McpError::WorkerUnavailable {
                    reason: format!(
                        "worker did not finish init after {}s",
                        READY_TIMEOUT.as_secs()
                    ),
                })
            }
        }

        tracing::info!("queue-based bridge started");
        Ok(Self {
            requests,
            board,
            worker: Mutex::new(Some((done_rx, thread))),
            closed: AtomicBool::new(false),
            response_timeout: RESPONSE_TIMEOUT,
        })
    }

    /// Override the per-caller reply wait (default [`RESPONSE_TIMEOUT`]).
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let method = Method::ListTools {
            server: server.to_string(),
        };
        match self.send_and_wait(server, "list_tools", method)? {
            Reply::Tools(tools) => Ok(tools),
            other => Err(unexpected(server, &other)),
        }
    }

    pub fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        let method = Method::CallTool {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
        };
        match self.send_and_wait(server, &format!("tools/call '{tool}'"), method)? {
            Reply::Called(result) => Ok(result),
            other => Err(unexpected(server, &other)),
        }
    }

    fn send_and_wait(&self, server: &str, operation: &str, method: Method) -> Result<Reply, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::WorkerUnavailable {
                reason: "bridge is closed".into(),
            });
        }

        let id = Uuid::new_v4();
        self.requests
            .send(PendingRequest { id, method })
            .map_err(|_| McpError::WorkerUnavailable {
                reason: "queue worker has exited".into(),
            })?;

        self.board
            .wait_for(&id, self.response_timeout)
            .unwrap_or_else(|| {
                Err(McpError::Timeout {
                    server: server.to_string(),
                    operation: operation.to_string(),
                    timeout_ms: self.response_timeout.as_millis() as u64,
                })
            })
    }

    /// Close every session and stop the worker. Idempotent and bounded by
    /// [`SHUTDOWN_TIMEOUT`].
    pub fn close(&self) {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some((done, thread)) = worker else {
            return;
        };
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!("closing queue-based bridge");

        let id = Uuid::new_v4();
        let acknowledged = self
            .requests
            .send(PendingRequest {
                id,
                method: Method::Close,
            })
            .is_ok()
            && self.board.wait_for(&id, SHUTDOWN_TIMEOUT).is_some();

        if !acknowledged {
            tracing::warn!("queue worker did not acknowledge close, detaching");
            return;
        }
        match done.recv_timeout(RUNTIME_TEARDOWN * 2) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!("queue worker still running after close, detaching");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Replies published but not yet collected.
    pub fn uncollected(&self) -> usize {
        self.board.uncollected()
    }
}

fn unexpected(server: &str, reply: &Reply) -> McpError {
    McpError::ProtocolError {
        server: server.to_string(),
        reason: format!("queue worker sent an unexpected reply: {reply:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::manager::tests::{registry, MockConnector, MockStats};
    use std::time::Instant;

    fn bridge() -> (QueueBridge, Arc<MockStats>) {
        let stats = Arc::new(MockStats::default());
        let connector = MockConnector {
            stats: Arc::clone(&stats),
            fail_connect: false,
        };
        let bridge = QueueBridge::start_with(registry(), connector, ToolCachePolicy::Cache).unwrap();
        (bridge, stats)
    }

    #[test]
    fn test_round_trip_and_cache() {
        let (bridge, stats) = bridge();
        let result = bridge.call_tool("alpha", "echo", serde_json::json!({})).unwrap();
        assert_eq!(result.first_text(), Some("alpha:echo"));

        bridge.list_tools("alpha").unwrap();
        bridge.list_tools("alpha").unwrap();
        assert_eq!(stats.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.uncollected(), 0);
        bridge.close();
    }

    #[test]
    fn test_unknown_server_fails_fast() {
        let (bridge, stats) = bridge();
        let err = bridge.call_tool("ghost", "echo", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
        assert_eq!(stats.connects.load(Ordering::SeqCst), 0);
        bridge.close();
    }

    #[test]
    fn test_interleaved_callers_get_their_own_replies() {
        let (bridge, _stats) = bridge();
        let bridge = Arc::new(bridge);

        // The slow call is submitted first; the fast one must not wait on it.
        let slow = {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || bridge.call_tool("beta", "slow", serde_json::json!({})))
        };
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        let fast = bridge.call_tool("alpha", "echo", serde_json::json!({})).unwrap();
        assert_eq!(fast.first_text(), Some("alpha:echo"));
        assert!(start.elapsed() < Duration::from_millis(250));

        let slow = slow.join().unwrap().unwrap();
        assert_eq!(slow.first_text(), Some("beta:slow"));
        bridge.close();
    }

    #[test]
    fn test_abandoned_reply_is_dropped() {
        let (bridge, _stats) = bridge();
        let bridge = bridge.with_response_timeout(Duration::from_millis(50));
        let err = bridge.call_tool("beta", "slow", serde_json::json!({})).unwrap_err();
        assert!(err.is_timeout());

        // Let the late reply arrive; it must not linger on the board.
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(bridge.uncollected(), 0);
        bridge.close();
    }

    #[test]
    fn test_close_twice_then_calls_fail() {
        let (bridge, stats) = bridge();
        bridge.list_tools("beta").unwrap();

        let start = Instant::now();
        bridge.close();
        bridge.close();
        assert!(start.elapsed() < SHUTDOWN_TIMEOUT);
        assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 1);

        let err = bridge.list_tools("beta").unwrap_err();
        assert!(matches!(err, McpError::WorkerUnavailable { .. }));
    }
}
