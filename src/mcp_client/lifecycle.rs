//! Session lifecycle management.
//!
//! Handles spawning, initializing, monitoring and shutting down tool server
//! child processes for the in-process protocol client. Each server runs as a
//! separate OS process communicating via JSON-RPC over stdio.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::connection::{Connector, ToolServerConnection};
use super::correlator::extract_result;
use super::errors::McpError;
use super::normalize::normalize_call_response;
use super::transport::StdioTransport;
use super::types::{
    initialize_params, InitializeResult, ListToolsResult, ServerInfo, ServerSpec, ToolDescriptor,
    ToolResult,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
///
/// Servers launched through `npx`/`uvx` may resolve packages on first start.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a server gets to exit after stdin is closed before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Max stderr captured into an error message (most recent bytes kept).
const STDERR_CAPTURE_LIMIT: usize = 2000;

/// How long a failed server's stderr gets to reach EOF.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

// ─── Session ─────────────────────────────────────────────────────────────────

/// A running, initialized tool server with its transport.
pub struct Session {
    /// Server name from the registry (e.g., "weather").
    pub name: String,
    /// The child process handle.
    process: Child,
    /// JSON-RPC transport (stdin/stdout).
    transport: StdioTransport,
    /// Whether the `initialize` handshake completed.
    initialized: bool,
    /// Server info received during initialization.
    pub server_info: Option<ServerInfo>,
}

impl Session {
    /// Spawn a server process and perform the initialization handshake.
    pub async fn connect(spec: &ServerSpec) -> Result<Self, McpError> {
        tracing::info!(server = %spec.name, command = %spec.command, args = ?spec.args, "starting server");

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);

        // Overrides on top of the inherited environment
        cmd.envs(&spec.env);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        // Wire stdio for JSON-RPC
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            name: spec.name.clone(),
            reason: format!("failed to spawn '{}': {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::ConnectionFailed {
            name: spec.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(McpError::ConnectionFailed {
            name: spec.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        // Drain stderr from the start; launchers can be chatty before they answer
        let stderr = child
            .stderr
            .take()
            .map(|handle| StderrCollector::start(&spec.name, handle));

        let mut session = Session {
            name: spec.name.clone(),
            process: child,
            transport: StdioTransport::new(&spec.name, stdin, stdout),
            initialized: false,
            server_info: None,
        };

        match session.initialize().await {
            Ok(()) => {
                tracing::info!(
                    server = %spec.name,
                    server_info = ?session.server_info,
                    "connected to server"
                );
                Ok(session)
            }
            Err(e) => {
                session.shutdown_process().await;
                let stderr_ctx = match stderr {
                    Some(collector) => collector.finish().await,
                    None => String::new(),
                };
                if !stderr_ctx.is_empty() {
                    tracing::warn!(
                        server = %spec.name,
                        stderr = %stderr_ctx,
                        "server stderr captured on failure"
                    );
                }
                let reason = match e {
                    McpError::Timeout { .. } => format!(
                        "initialization timed out after {}s",
                        INIT_TIMEOUT.as_secs()
                    ),
                    other => other.to_string(),
                };
                Err(McpError::ConnectionFailed {
                    name: spec.name.clone(),
                    reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
                })
            }
        }
    }

    /// Perform the MCP initialization handshake.
    async fn initialize(&mut self) -> Result<(), McpError> {
        let response = self
            .transport
            .request("initialize", Some(initialize_params()), INIT_TIMEOUT)
            .await?;

        let result = extract_result(response)?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::ProtocolError {
                server: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.transport
            .notify("notifications/initialized", None)
            .await?;

        self.server_info = init.server_info;
        self.initialized = true;
        Ok(())
    }

    /// Whether the handshake completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Close stdin, wait for a graceful exit, then force-kill.
    async fn shutdown_process(&mut self) {
        self.transport.close_stdin();

        match tokio::time::timeout(SHUTDOWN_GRACE, self.process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "server exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "server did not exit in time, killing");
                let _ = self.process.kill().await;
            }
        }
        self.initialized = false;
    }
}

#[async_trait]
impl ToolServerConnection for Session {
    fn is_alive(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    async fn list_tools(&mut self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
        let response = self
            .transport
            .request("tools/list", Some(serde_json::json!({})), timeout)
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
        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });

        let response = self
            .transport
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
        self.shutdown_process().await;
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Connector for the in-process protocol client.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioConnector;

#[async_trait]
impl Connector for StdioConnector {
    type Connection = Session;

    async fn connect(&self, spec: &ServerSpec) -> Result<Session, McpError> {
        Session::connect(spec).await
    }
}

// ─── Stderr Helpers ──────────────────────────────────────────────────────────

/// Drains a server's stderr for its whole life, logging each line and
/// keeping the most recent output for error messages.
struct StderrCollector {
    tail: Arc<Mutex<StderrTail>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct StderrTail {
    text: String,
    truncated: bool,
}

impl StderrTail {
    fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.text.len() > STDERR_CAPTURE_LIMIT {
            let mut cut = self.text.len() - STDERR_CAPTURE_LIMIT;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    fn render(&self) -> String {
        if self.truncated {
            format!("(truncated)...{}", self.text)
        } else {
            self.text.clone()
        }
    }
}

impl StderrCollector {
    fn start(server: &str, stderr: ChildStderr) -> Self {
        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let task = tokio::spawn(collect_stderr(server.to_string(), stderr, Arc::clone(&tail)));
        Self { tail, task }
    }

    /// Give the pipe a moment to close, then return what was captured.
    async fn finish(self) -> String {
        let StderrCollector { tail, task } = self;
        let _ = tokio::time::timeout(STDERR_SETTLE, task).await;
        tail.lock().map(|t| t.render()).unwrap_or_default()
    }
}

async fn collect_stderr(server: String, stderr: ChildStderr, tail: Arc<Mutex<StderrTail>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, "stderr: {line}");
        if let Ok(mut tail) = tail.lock() {
            tail.push_line(&line);
        }
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub(crate) fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
