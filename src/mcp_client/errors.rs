//! MCP Client error types.
//!
//! Transport and process faults are always returned to the caller that
//! issued the operation. Tool-level failures (`isError`) are NOT errors here;
//! they come back as a normal [`ToolResult`](super::types::ToolResult) whose
//! content carries an `error` item.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server name is not present in the registry. Nothing was spawned.
    #[error("server '{name}' not found in registry")]
    ServerNotFound { name: String },

    /// Spawning the server process or the `initialize` handshake failed.
    ///
    /// Fatal to this session attempt only; the next call spawns again.
    #[error("failed to connect to server '{name}': {reason}")]
    ConnectionFailed { name: String, reason: String },

    /// A round trip exceeded its time budget. The session stays usable.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Malformed or missing response line.
    #[error("protocol error for server '{server}': {reason}")]
    ProtocolError { server: String, reason: String },

    /// Server returned a JSON-RPC error response (non tool-call methods).
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The bridge was closed, or its worker thread is gone.
    #[error("bridge worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    /// Configuration error (missing registry file, bad YAML).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Whether the error is a timeout of any operation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// The server name the error refers to, when there is one.
    pub fn server(&self) -> Option<&str> {
        match self {
            McpError::ServerNotFound { name } | McpError::ConnectionFailed { name, .. } => {
                Some(name)
            }
            McpError::Timeout { server, .. } | McpError::ProtocolError { server, .. } => {
                Some(server)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = McpError::Timeout {
            server: "weather".into(),
            operation: "tools/call 'forecast'".into(),
            timeout_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "tools/call 'forecast' on server 'weather' timed out after 1500ms"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn test_server_accessor() {
        let err = McpError::ServerNotFound {
            name: "ghost".into(),
        };
        assert_eq!(err.server(), Some("ghost"));

        let err = McpError::WorkerUnavailable {
            reason: "closed".into(),
        };
        assert_eq!(err.server(), None);
        assert!(!err.is_timeout());
    }
}
