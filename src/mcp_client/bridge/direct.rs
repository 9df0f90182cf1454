//! Direct-async bridge: operations are awaited in the caller's runtime.
//!
//! When the host declares its ambient runtime reentrant, nothing is run in
//! place. Every operation is delegated to a [`ThreadBridge`] instead, so the
//! session manager never shares a scheduler with the host.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::run_blocking;
use super::threaded::ThreadBridge;
use crate::mcp_client::connection::Connector;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::StdioConnector;
use crate::mcp_client::manager::{SessionManager, ToolCachePolicy};
use crate::mcp_client::registry::ServerRegistry;
use crate::mcp_client::types::{ToolDescriptor, ToolResult};

type IsolatedFactory = Arc<dyn Fn() -> Result<ThreadBridge, McpError> + Send + Sync>;

enum Mode {
    InLoop(SessionManager),
    Delegated {
        start: IsolatedFactory,
        bridge: Mutex<Option<Arc<ThreadBridge>>>,
    },
}

pub struct DirectBridge {
    mode: Mode,
}

impl DirectBridge {
    /// Must be called from within a Tokio runtime.
    pub fn new(registry: Arc<ServerRegistry>, policy: ToolCachePolicy, ambient_reentrant: bool) -> Self {
        Self::with_connector(registry, StdioConnector, policy, ambient_reentrant)
    }

    pub fn with_connector<C: Connector + Clone>(
        registry: Arc<ServerRegistry>,
        connector: C,
        policy: ToolCachePolicy,
        ambient_reentrant: bool,
    ) -> Self {
        let mode = if ambient_reentrant {
            tracing::info!("ambient runtime is reentrant, delegating to a worker thread");
            Mode::Delegated {
                start: Arc::new(move || {
                    ThreadBridge::start_with(Arc::clone(&registry), connector.clone(), policy)
                }),
                bridge: Mutex::new(None),
            }
        } else {
            Mode::InLoop(SessionManager::spawn(registry, connector, policy))
        };
        Self { mode }
    }

    pub fn is_delegating(&self) -> bool {
        matches!(self.mode, Mode::Delegated { .. })
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        match &self.mode {
            Mode::InLoop(manager) => manager.list_tools(server).await,
            Mode::Delegated { start, bridge } => {
                let isolated = isolated(start, bridge).await?;
                let server = server.to_string();
                run_blocking(move || isolated.list_tools(&server)).await
            }
        }
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        match &self.mode {
            Mode::InLoop(manager) => manager.call_tool(server, tool, arguments).await,
            Mode::Delegated { start, bridge } => {
                let isolated = isolated(start, bridge).await?;
                let server = server.to_string();
                let tool = tool.to_string();
                run_blocking(move || isolated.call_tool(&server, &tool, arguments)).await
            }
        }
    }

    /// Close every session. Later calls start sessions again.
    pub async fn close(&self) {
        match &self.mode {
            Mode::InLoop(manager) => manager.close().await,
            Mode::Delegated { bridge, .. } => {
                let Some(isolated) = bridge.lock().await.take() else {
                    return;
                };
                if let Err(e) = run_blocking(move || {
                    isolated.close();
                    Ok(())
                })
                .await
                {
                    tracing::warn!(error = %e, "closing delegated bridge failed");
                }
            }
        }
    }
}

/// The delegated worker, started on first use.
async fn isolated(
    start: &IsolatedFactory,
    slot: &Mutex<Option<Arc<ThreadBridge>>>,
) -> Result<Arc<ThreadBridge>, McpError> {
    let mut slot = slot.lock().await;
    if let Some(bridge) = slot.as_ref() {
        return Ok(Arc::clone(bridge));
    }
    let start = Arc::clone(start);
    let bridge = Arc::new(run_blocking(move || (*start)()).await?);
    *slot = Some(Arc::clone(&bridge));
    Ok(bridge)
}
