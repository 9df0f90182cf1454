//! The seam between the session manager and a concrete tool server link.
//!
//! Two connectors ship with the crate: the in-process protocol client
//! ([`StdioConnector`](super::lifecycle::StdioConnector)) and the raw
//! subprocess JSON-RPC client
//! ([`RawConnector`](super::bridge::subprocess::RawConnector)).

use std::time::Duration;

use async_trait::async_trait;

use super::errors::McpError;
use super::types::{ServerSpec, ToolDescriptor, ToolResult};

/// A live, initialized link to one tool server.
///
/// Owned by exactly one server worker; every method takes `&mut self`.
#[async_trait]
pub trait ToolServerConnection: Send {
    /// Whether the server process is still running.
    fn is_alive(&mut self) -> bool;

    /// `tools/list`, with descriptors tagged by server name.
    async fn list_tools(&mut self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError>;

    /// `tools/call`, normalized.
    async fn call_tool(
        &mut self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResult, McpError>;

    /// Best-effort termination. Never fails.
    async fn shutdown(&mut self);
}

/// Spawns and initializes connections from launch specs.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: ToolServerConnection + 'static;

    async fn connect(&self, spec: &ServerSpec) -> Result<Self::Connection, McpError>;
}
