//! Concurrency bridge: one contract, four ways to reach the session manager.
//!
//! | Strategy          | Where sessions live                          |
//! |-------------------|----------------------------------------------|
//! | `direct`          | the caller's runtime (or a worker thread when the host runtime is declared reentrant) |
//! | `thread_isolated` | a dedicated thread with its own runtime      |
//! | `queued`          | a worker thread fed by a request queue       |
//! | `subprocess`      | the caller's runtime, raw JSON-RPC over pipes |
//!
//! [`McpBridge`] wraps all four behind async `list_tools`, `call_tool` and
//! `close`. The blocking variants are driven through `spawn_blocking`.

pub mod direct;
pub mod queued;
pub mod subprocess;
pub mod threaded;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use super::errors::McpError;
use super::manager::ToolCachePolicy;
use super::registry::ServerRegistry;
use super::types::{ToolDescriptor, ToolResult};

pub use direct::DirectBridge;
pub use queued::QueueBridge;
pub use subprocess::{RawConnector, SubprocessBridge};
pub use threaded::ThreadBridge;

// ─── Strategy Selection ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStrategy {
    #[default]
    Direct,
    ThreadIsolated,
    Queued,
    Subprocess,
}

impl BridgeStrategy {
    pub const ALL: [BridgeStrategy; 4] = [
        BridgeStrategy::Direct,
        BridgeStrategy::ThreadIsolated,
        BridgeStrategy::Queued,
        BridgeStrategy::Subprocess,
    ];

    /// Raw subprocess sessions re-query tools; the others cache them.
    pub fn default_cache_policy(self) -> ToolCachePolicy {
        match self {
            BridgeStrategy::Subprocess => ToolCachePolicy::Refetch,
            _ => ToolCachePolicy::Cache,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStrategy::Direct => "direct",
            BridgeStrategy::ThreadIsolated => "thread_isolated",
            BridgeStrategy::Queued => "queued",
            BridgeStrategy::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for BridgeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeStrategy {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        BridgeStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| McpError::ConfigError {
                reason: format!(
                    "unknown bridge strategy '{s}' (expected direct, thread_isolated, queued or subprocess)"
                ),
            })
    }
}

/// Options shared by every strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOptions {
    /// The host runtime allows nested execution; `direct` then delegates.
    pub ambient_reentrant: bool,
    /// Overrides the strategy's default tool cache policy.
    pub tool_cache: Option<ToolCachePolicy>,
}

// ─── McpBridge ───────────────────────────────────────────────────────────────

pub enum McpBridge {
    Direct(DirectBridge),
    ThreadIsolated(Arc<ThreadBridge>),
    Queued(Arc<QueueBridge>),
    Subprocess(SubprocessBridge),
}

impl McpBridge {
    pub async fn start(
        strategy: BridgeStrategy,
        registry: Arc<ServerRegistry>,
        options: BridgeOptions,
    ) -> Result<Self, McpError> {
        let policy = options
            .tool_cache
            .unwrap_or_else(|| strategy.default_cache_policy());
        tracing::info!(
            %strategy,
            ?policy,
            ambient_reentrant = options.ambient_reentrant,
            servers = registry.len(),
            "starting bridge"
        );

        Ok(match strategy {
            BridgeStrategy::Direct => {
                McpBridge::Direct(DirectBridge::new(registry, policy, options.ambient_reentrant))
            }
            BridgeStrategy::ThreadIsolated => McpBridge::ThreadIsolated(Arc::new(
                run_blocking(move || ThreadBridge::start(registry, policy)).await?,
            )),
            BridgeStrategy::Queued => McpBridge::Queued(Arc::new(
                run_blocking(move || QueueBridge::start(registry, policy)).await?,
            )),
            BridgeStrategy::Subprocess => {
                McpBridge::Subprocess(SubprocessBridge::start(registry, policy))
            }
        })
    }

    pub fn strategy(&self) -> BridgeStrategy {
        match self {
            McpBridge::Direct(_) => BridgeStrategy::Direct,
            McpBridge::ThreadIsolated(_) => BridgeStrategy::ThreadIsolated,
            McpBridge::Queued(_) => BridgeStrategy::Queued,
            McpBridge::Subprocess(_) => BridgeStrategy::Subprocess,
        }
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        match self {
            McpBridge::Direct(b) => b.list_tools(server).await,
            McpBridge::ThreadIsolated(b) => {
                let (b, server) = (Arc::clone(b), server.to_string());
                run_blocking(move || b.list_tools(&server)).await
            }
            McpBridge::Queued(b) => {
                let (b, server) = (Arc::clone(b), server.to_string());
                run_blocking(move || b.list_tools(&server)).await
            }
            McpBridge::Subprocess(b) => b.list_tools(server).await,
        }
    }

    /// List tools on several servers at once.
    ///
    /// A failing server is logged and reported in its own slot; the others
    /// are unaffected. Results keep the order of `servers`.
    pub async fn list_all_tools(
        &self,
        servers: &[&str],
    ) -> Vec<(String, Result<Vec<ToolDescriptor>, McpError>)> {
        let listings = servers.iter().map(|server| async move {
            let result = self.list_tools(server).await;
            if let Err(e) = &result {
                tracing::warn!(server = %server, error = %e, "failed to list tools, skipping server");
            }
            (server.to_string(), result)
        });
        futures::future::join_all(listings).await
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        match self {
            McpBridge::Direct(b) => b.call_tool(server, tool, arguments).await,
            McpBridge::ThreadIsolated(b) => {
                let (b, server, tool) = (Arc::clone(b), server.to_string(), tool.to_string());
                run_blocking(move || b.call_tool(&server, &tool, arguments)).await
            }
            McpBridge::Queued(b) => {
                let (b, server, tool) = (Arc::clone(b), server.to_string(), tool.to_string());
                run_blocking(move || b.call_tool(&server, &tool, arguments)).await
            }
            McpBridge::Subprocess(b) => b.call_tool(server, tool, arguments).await,
        }
    }

    /// Close every session. Idempotent.
    pub async fn close(&self) {
        let closed = match self {
            McpBridge::Direct(b) => {
                b.close().await;
                Ok(())
            }
            McpBridge::ThreadIsolated(b) => {
                let b = Arc::clone(b);
                run_blocking(move || {
                    b.close();
                    Ok(())
                })
                .await
            }
            McpBridge::Queued(b) => {
                let b = Arc::clone(b);
                run_blocking(move || {
                    b.close();
                    Ok(())
                })
                .await
            }
            McpBridge::Subprocess(b) => {
                b.close().await;
                Ok(())
            }
        };
        if let Err(e) = closed {
            tracing::warn!(error = %e, "bridge close did not complete");
        }
    }
}

/// Run a blocking bridge call on Tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, McpError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, McpError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| McpError::WorkerUnavailable {
            reason: format!("blocking bridge call failed: {e}"),
        })?
}
