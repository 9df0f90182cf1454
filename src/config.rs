//! Bridge configuration (`vtube-bridge.yaml`).
//!
//! ```yaml
//! strategy: thread_isolated
//! ambient_reentrant: false
//! registry_path: ${BRIDGE_HOME:-~/.vtube}/mcp_servers.json
//! tool_cache: default
//! ```
//!
//! String values may use `${VAR}` and `${VAR:-default}`; defaults may start
//! with `~`. A relative `registry_path` is resolved against the directory of
//! the config file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::mcp_client::{BridgeOptions, BridgeStrategy, McpError, ToolCachePolicy};

pub const CONFIG_FILE_NAME: &str = "vtube-bridge.yaml";

/// Env var naming a config file to use instead of searching.
pub const CONFIG_ENV_VAR: &str = "VTUBE_BRIDGE_CONFIG";

pub const DEFAULT_REGISTRY_FILE: &str = "mcp_servers.json";

/// `tool_cache` setting. `default` keeps the strategy's own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCacheSetting {
    #[default]
    Default,
    Always,
    Never,
}

impl ToolCacheSetting {
    pub fn policy(self) -> Option<ToolCachePolicy> {
        match self {
            ToolCacheSetting::Default => None,
            ToolCacheSetting::Always => Some(ToolCachePolicy::Cache),
            ToolCacheSetting::Never => Some(ToolCachePolicy::Refetch),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub strategy: BridgeStrategy,

    /// Declares that the host runtime allows nested execution. The direct
    /// strategy then runs every operation on a worker thread.
    #[serde(default)]
    pub ambient_reentrant: bool,

    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    #[serde(default)]
    pub tool_cache: ToolCacheSetting,
}

fn default_registry_path() -> PathBuf {
    PathBuf::from(DEFAULT_REGISTRY_FILE)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            strategy: BridgeStrategy::default(),
            ambient_reentrant: false,
            registry_path: default_registry_path(),
            tool_cache: ToolCacheSetting::default(),
        }
    }
}

impl BridgeConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        // An empty file is a valid "all defaults" config.
        let interpolated = interpolate_env_vars(&raw);
        let mut config: BridgeConfig = if interpolated.trim().is_empty() {
            BridgeConfig::default()
        } else {
            serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.registry_path = resolve_relative(base, &config.registry_path);
        Ok(config)
    }

    /// Find a config file from `start` and load it, or fall back to defaults
    /// with the registry expected in `start`.
    pub fn discover(start: &Path) -> Result<Self, McpError> {
        match find_config_path(start) {
            Some(path) => {
                tracing::info!(config = %path.display(), "loading bridge config");
                Self::load(&path)
            }
            None => {
                tracing::debug!(start = %start.display(), "no bridge config found, using defaults");
                let mut config = BridgeConfig::default();
                config.registry_path = resolve_relative(start, &config.registry_path);
                Ok(config)
            }
        }
    }

    pub fn options(&self) -> BridgeOptions {
        BridgeOptions {
            ambient_reentrant: self.ambient_reentrant,
            tool_cache: self.tool_cache.policy(),
        }
    }
}

/// Locate the config file.
///
/// Checks `VTUBE_BRIDGE_CONFIG` first, then searches upward from `start`
/// for `vtube-bridge.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    // 1. Check env var
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file, searching instead");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Expand `~`, then anchor relative paths at `base`.
fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    let path = match path.to_str() {
        Some(s) => PathBuf::from(expand_tilde(s)),
        None => path.to_path_buf(),
    };
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
