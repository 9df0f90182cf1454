//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with a tool server child process:
//! - Writing JSON-RPC requests to stdin
//! - Reading stdout on a background task, one JSON object per line
//! - Matching replies to requests by id (see [`correlator`](super::correlator))

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::correlator::{self, Inbound};
use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
///
/// Owned exclusively by one server worker, so requests never interleave.
pub struct StdioTransport {
    server_name: String,
    writer: Option<ChildStdin>,
    inbound: UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    ///
    /// Must be called from within a Tokio runtime (spawns the reader task).
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (tx, inbound) = unbounded_channel();
        let reader = tokio::spawn(read_stdout(server_name.to_string(), stdout, tx));
        Self {
            server_name: server_name.to_string(),
            writer: Some(stdin),
            inbound,
            reader,
        }
    }

    /// Send a JSON-RPC request and wait up to `timeout` for the matching
    /// response.
    ///
    /// On timeout the reply, if it ever arrives, is discarded by the next
    /// request.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = correlator::next_request_id();
        let req = JsonRpcRequest::new(id.clone(), method, params);

        let line = req.to_line().map_err(|e| McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        correlator::drain_stale(&self.server_name, &mut self.inbound);
        self.write_line(&line).await?;

        tokio::time::timeout(
            timeout,
            correlator::await_response(&self.server_name, &mut self.inbound, &id),
        )
        .await
        .map_err(|_| McpError::Timeout {
            server: self.server_name.clone(),
            operation: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut line =
            serde_json::to_string(&notification).map_err(|e| McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;
        line.push('\n');

        self.write_line(&line).await
    }

    /// Close the child's stdin. Stdio servers treat EOF as a shutdown request.
    pub fn close_stdin(&mut self) {
        self.writer.take();
    }

    async fn write_line(&mut self, line: &str) -> Result<(), McpError> {
        let writer = self.writer.as_mut().ok_or_else(|| McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Reader task: forward classified stdout lines until EOF.
async fn read_stdout(server: String, stdout: ChildStdout, tx: UnboundedSender<Inbound>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(msg) = correlator::classify_line(&line) {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server, "server stdout closed");
                break;
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
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn(script: &str) -> (tokio::process::Child, StdioTransport) {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = StdioTransport::new("sh", stdin, stdout);
        (child, transport)
    }

    #[tokio::test]
    async fn test_malformed_line_is_protocol_error() {
        let (_child, mut transport) = spawn("read line; echo 'hello from a chatty server'; sleep 5");
        let err = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ProtocolError { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_exited_server_is_protocol_error() {
        let (_child, mut transport) = spawn("exit 0");
        let err = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ProtocolError { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (_child, mut transport) = spawn("sleep 5");
        let err = transport
            .request("tools/list", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { operation, .. } => assert_eq!(operation, "tools/list"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_after_close_stdin_fails() {
        let (_child, mut transport) = spawn("sleep 5");
        transport.close_stdin();
        let err = transport.notify("ping", None).await.unwrap_err();
        assert!(err.to_string().contains("stdin already closed"));
    }
}
