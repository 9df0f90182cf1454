//! MCP Client: tool-protocol sessions and the concurrency bridge over them.
//!
//! This module handles:
//! - Spawning tool server child processes and the `initialize` handshake
//! - JSON-RPC 2.0 over process stdio, with replies matched by request id
//! - One serialized session per named server, created on first use
//! - Normalizing tool responses into `{metadata, content_items}`
//! - Four bridge strategies for reaching sessions from sync or async callers

pub mod bridge;
pub mod connection;
pub mod correlator;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod normalize;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use bridge::{BridgeOptions, BridgeStrategy, McpBridge};
pub use connection::{Connector, ToolServerConnection};
pub use errors::McpError;
pub use lifecycle::{Session, StdioConnector};
pub use manager::{SessionManager, ToolCachePolicy};
pub use registry::ServerRegistry;
pub use types::{ContentItem, ContentType, ServerSpec, ToolDescriptor, ToolResult};
