//! Raw subprocess JSON-RPC client.
//!
//! Speaks line-delimited JSON-RPC to the child directly, without the
//! in-process protocol client: blocking pipe I/O on helper threads, awaited
//! with bounded timeouts. Request ids are UUID strings. Each spawned process
//! gets exactly one `initialize` handshake. Tool listings are re-queried on
//! every call by default.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::mcp_client::connection::{Connector, ToolServerConnection};
use crate::mcp_client::correlator::{self, extract_result, Inbound};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::SHUTDOWN_GRACE;
use crate::mcp_client::manager::{SessionManager, ToolCachePolicy};
use crate::mcp_client::normalize::normalize_call_response;
use crate::mcp_client::registry::ServerRegistry;
use crate::mcp_client::types::{
    initialize_params, JsonRpcRequest, JsonRpcResponse, ListToolsResult, ServerSpec,
    ToolDescriptor, ToolResult,
};

/// Timeout for `initialize` and `tools/list`.
pub const RAW_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ─── RawProcess ──────────────────────────────────────────────────────────────

/// A spawned server process driven with raw JSON-RPC lines.
pub struct RawProcess {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    inbound: UnboundedReceiver<Inbound>,
}

impl RawProcess {
    /// Spawn the server and run the `initialize` handshake.
    pub async fn spawn(spec: &ServerSpec) -> Result<Self, McpError> {
        tracing::info!(server = %spec.name, command = %spec.command, "starting raw subprocess server");

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            name: spec.name.clone(),
            reason: format!("failed to spawn '{}': {e}", spec.command),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(McpError::ConnectionFailed {
                name: spec.name.clone(),
                reason: "failed to capture stdio".into(),
            });
        };

        let (tx, inbound) = unbounded_channel();
        let reader_name = spec.name.clone();
        let reader = std::thread::Builder::new()
            .name(format!("mcp-raw-{}", spec.name))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            if let Some(msg) = correlator::classify_line(&line) {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Inbound::Malformed {
                                line: String::new(),
                                reason: format!("failed to read from stdout: {e}"),
                            });
                            break;
                        }
                    }
                }
                tracing::debug!(server = %reader_name, "raw reader exited");
            });
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(McpError::ConnectionFailed {
                name: spec.name.clone(),
                reason: format!("failed to start reader thread: {e}"),
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let server = spec.name.clone();
            let _ = std::thread::Builder::new()
                .name(format!("mcp-raw-stderr-{}", spec.name))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        tracing::debug!(server = %server, "stderr: {line}");
                    }
                });
        }

        let mut process = Self {
            name: spec.name.clone(),
            child,
            stdin: Some(stdin),
            inbound,
        };

        match process.handshake().await {
            Ok(()) => {
                tracing::info!(server = %spec.name, "raw subprocess server initialized");
                Ok(process)
            }
            Err(e) => {
                process.terminate().await;
                Err(McpError::ConnectionFailed {
                    name: spec.name.clone(),
                    reason: format!("initialize failed: {e}"),
                })
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), McpError> {
        let response = self
            .request("initialize", Some(initialize_params()), RAW_REQUEST_TIMEOUT)
            .await?;
        extract_result(response).map(|_| ())
    }

    /// Send one request and wait for the reply with the same id.
    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = correlator::uuid_request_id();
        let line = JsonRpcRequest::new(id.clone(), method, params)
            .to_line()
            .map_err(|e| McpError::ProtocolError {
                server: self.name.clone(),
                reason: format!("failed to serialize request: {e}"),
            })?;

        correlator::drain_stale(&self.name, &mut self.inbound);
        self.write_line(line).await?;

        tokio::time::timeout(
            timeout,
            correlator::await_response(&self.name, &mut self.inbound, &id),
        )
        .await
        .map_err(|_| McpError::Timeout {
            server: self.name.clone(),
            operation: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
    }

    /// Blocking pipe write, moved off the async thread.
    async fn write_line(&mut self, line: String) -> Result<(), McpError> {
        let mut stdin = self.stdin.take().ok_or_else(|| McpError::ProtocolError {
            server: self.name.clone(),
            reason: "stdin already closed".into(),
        })?;

        let (stdin, result) = tokio::task::spawn_blocking(move || {
            let result = stdin
                .write_all(line.as_bytes())
                .and_then(|()| stdin.flush());
            (stdin, result)
        })
        .await
        .map_err(|e| McpError::ProtocolError {
            server: self.name.clone(),
            reason: format!("write task failed: {e}"),
        })?;

        self.stdin = Some(stdin);
        result.map_err(|e| McpError::ProtocolError {
            server: self.name.clone(),
            reason: format!("failed to write to stdin: {e}"),
        })
    }

    /// Close stdin, poll for exit until the grace period ends, then kill.
    async fn terminate(&mut self) {
        self.stdin.take();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(server = %self.name, %status, "raw subprocess exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                }
                _ => break,
            }
        }

        tracing::warn!(server = %self.name, "raw subprocess did not exit in time, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[async_trait]
impl ToolServerConnection for RawProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn list_tools(&mut self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
        let response = self
            .request(
                "tools/list",
                Some(serde_json::json!({})),
                timeout.min(RAW_REQUEST_TIMEOUT),
            )
            .await?;
        let result = extract_result(response)?;

        let listing: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::ProtocolError {
                server: self.name.clone(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        Ok(listing
            .tools
            .into_iter()
            .map(|mut tool| {
                tool.server_name = self.name.clone();
                tool
            })
            .collect())
    }

    async fn call_tool(
        &mut self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResult, McpError> {
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let response = self
            .request("tools/call", Some(params), timeout)
            .await
            .map_err(|e| match e {
                McpError::Timeout {
                    server, timeout_ms, ..
                } => McpError::Timeout {
                    server,
                    operation: format!("tools/call '{tool}'"),
                    timeout_ms,
                },
                other => other,
            })?;
        normalize_call_response(&self.name, response)
    }

    async fn shutdown(&mut self) {
        self.terminate().await;
    }
}

impl Drop for RawProcess {
    fn drop(&mut self) {
        // std children outlive their handle unless killed.
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Connector for the raw subprocess client.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawConnector;

#[async_trait]
impl Connector for RawConnector {
    type Connection = RawProcess;

    async fn connect(&self, spec: &ServerSpec) -> Result<RawProcess, McpError> {
        RawProcess::spawn(spec).await
    }
}

// ─── SubprocessBridge ────────────────────────────────────────────────────────

/// Async bridge over raw subprocess sessions.
#[derive(Clone)]
pub struct SubprocessBridge {
    manager: SessionManager,
}

impl SubprocessBridge {
    /// Must be called from within a Tokio runtime.
    pub fn start(registry: Arc<ServerRegistry>, policy: ToolCachePolicy) -> Self {
        tracing::info!(?policy, "raw subprocess bridge started");
        Self {
            manager: SessionManager::spawn(registry, RawConnector, policy),
        }
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        self.manager.list_tools(server).await
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        self.manager.call_tool(server, tool, arguments).await
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_connection_error() {
        let spec = ServerSpec::new("missing", "/definitely/not/a/real/binary", &[]);
        let err = RawConnector.connect(&spec).await.err().unwrap();
        assert!(matches!(err, McpError::ConnectionFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_server_that_exits_fails_handshake() {
        let spec = ServerSpec::new("quitter", "sh", &["-c", "exit 0"]);
        let err = RawConnector.connect(&spec).await.err().unwrap();
        match err {
            McpError::ConnectionFailed { reason, .. } => {
                assert!(reason.contains("initialize failed"), "{reason}")
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_handshake_reply_is_killed_and_reported() {
        let spec = ServerSpec::new("chatty", "sh", &["-c", "read line; echo 'hello there'; sleep 30"]);
        let start = Instant::now();
        let err = RawConnector.connect(&spec).await.err().unwrap();
        match err {
            McpError::ConnectionFailed { reason, .. } => {
                assert!(reason.contains("invalid JSON"), "{reason}")
            }
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert!(start.elapsed() < SHUTDOWN_GRACE + Duration::from_secs(2));
    }
}
