//! Server registry: named launch specs for tool servers.
//!
//! Loaded from `mcp_servers.json`:
//!
//! ```json
//! { "mcp_servers": { "time": { "command": "uvx", "args": ["mcp-server-time"], "timeout": 30 } } }
//! ```
//!
//! The `mcpServers` key is accepted as well. Entries without `command`/`args`,
//! or whose launcher (`npx`, `uvx`, `node`) is not on `PATH`, are skipped.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::types::{ServerSpec, DEFAULT_SERVER_TIMEOUT};

/// Launchers whose presence on `PATH` is checked before accepting an entry.
const CHECKED_RUNTIMES: &[&str] = &["npx", "uvx", "node"];

/// Raw registry entry as it appears in the JSON file.
#[derive(Debug, Deserialize)]
struct RawServerEntry {
    command: Option<String>,
    args: Option<Vec<String>>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    timeout: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRegistryFile {
    #[serde(default)]
    mcp_servers: HashMap<String, RawServerEntry>,
    #[serde(default, rename = "mcpServers")]
    mcp_servers_camel: HashMap<String, RawServerEntry>,
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Named server launch specs. Immutable once shared with a bridge.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: HashMap<String, ServerSpec>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from specs (later duplicates replace earlier ones).
    pub fn from_specs(specs: impl IntoIterator<Item = ServerSpec>) -> Self {
        Self {
            servers: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Load the registry from a `.json` file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(McpError::ConfigError {
                reason: format!("registry file '{}' is not a .json file", path.display()),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        Self::parse(&raw, runtime_on_path)
    }

    /// Parse registry JSON. `runtime_available` decides whether a checked
    /// launcher exists.
    fn parse(raw: &str, runtime_available: impl Fn(&str) -> bool) -> Result<Self, McpError> {
        let file: RawRegistryFile =
            serde_json::from_str(raw).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse registry: {e}"),
            })?;

        let entries = if file.mcp_servers.is_empty() {
            file.mcp_servers_camel
        } else {
            file.mcp_servers
        };

        if entries.is_empty() {
            tracing::warn!("no servers found in the registry file");
        }

        let mut servers = HashMap::new();
        for (name, entry) in entries {
            let (Some(command), Some(args)) = (entry.command, entry.args) else {
                tracing::warn!(server = %name, "invalid server entry (needs command and args), ignoring");
                continue;
            };

            if CHECKED_RUNTIMES.contains(&command.as_str()) && !runtime_available(&command) {
                tracing::warn!(server = %name, command = %command, "launcher not available on PATH, ignoring");
                continue;
            }

            let timeout = match entry.timeout.as_ref().and_then(|t| t.as_f64()) {
                Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
                    tracing::warn!(server = %name, secs, "timeout out of range, using default");
                    DEFAULT_SERVER_TIMEOUT
                }),
                _ => DEFAULT_SERVER_TIMEOUT,
            };

            tracing::debug!(server = %name, "loaded server");
            servers.insert(
                name.clone(),
                ServerSpec {
                    name,
                    command,
                    args,
                    env: entry.env.unwrap_or_default(),
                    timeout,
                },
            );
        }

        Ok(Self { servers })
    }

    /// Look up a server by name.
    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.get(name)
    }

    /// Add or replace a server.
    pub fn insert(&mut self, spec: ServerSpec) {
        self.servers.insert(spec.name.clone(), spec);
    }

    /// Remove a server, returning its spec if it was present.
    pub fn remove(&mut self, name: &str) -> Option<ServerSpec> {
        let removed = self.servers.remove(name);
        if removed.is_none() {
            tracing::warn!(server = name, "server not found, cannot remove");
        }
        removed
    }

    /// Sorted server names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Whether an executable named `program` exists in any `PATH` directory.
fn runtime_on_path(program: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && dir.join(format!("{program}.cmd")).is_file())
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn all_runtimes(_: &str) -> bool {
        true
    }

    #[test]
    fn test_parse_snake_case_key() {
        let json = r#"{
            "mcp_servers": {
                "time": {"command": "uvx", "args": ["mcp-server-time"], "timeout": 30},
                "local": {"command": "python3", "args": ["server.py"], "env": {"DEBUG": "1"}}
            }
        }"#;
        let registry = ServerRegistry::parse(json, all_runtimes).unwrap();
        assert_eq!(registry.names(), vec!["local", "time"]);

        let time = registry.get("time").unwrap();
        assert_eq!(time.timeout, Duration::from_secs(30));
        assert_eq!(time.args, vec!["mcp-server-time"]);

        let local = registry.get("local").unwrap();
        assert_eq!(local.timeout, DEFAULT_SERVER_TIMEOUT);
        assert_eq!(local.env.get("DEBUG").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_parse_camel_case_key_and_float_timeout() {
        let json = r#"{"mcpServers": {"fs": {"command": "node", "args": ["fs.js"], "timeout": 2.5}}}"#;
        let registry = ServerRegistry::parse(json, all_runtimes).unwrap();
        assert_eq!(
            registry.get("fs").unwrap().timeout,
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let json = r#"{"mcp_servers": {
            "no_args": {"command": "python3"},
            "no_command": {"args": []},
            "bad_timeout": {"command": "python3", "args": [], "timeout": "soon"}
        }}"#;
        let registry = ServerRegistry::parse(json, all_runtimes).unwrap();
        assert_eq!(registry.names(), vec!["bad_timeout"]);
        assert_eq!(
            registry.get("bad_timeout").unwrap().timeout,
            DEFAULT_SERVER_TIMEOUT
        );
    }

    #[test]
    fn test_out_of_range_timeout_falls_back_to_default() {
        let json = r#"{"mcp_servers": {
            "huge": {"command": "python3", "args": [], "timeout": 1e30},
            "negative": {"command": "python3", "args": [], "timeout": -5}
        }}"#;
        let registry = ServerRegistry::parse(json, all_runtimes).unwrap();
        assert_eq!(registry.get("huge").unwrap().timeout, DEFAULT_SERVER_TIMEOUT);
        assert_eq!(registry.get("negative").unwrap().timeout, DEFAULT_SERVER_TIMEOUT);
    }

    #[test]
    fn test_missing_runtime_is_skipped() {
        let json = r#"{"mcp_servers": {
            "a": {"command": "npx", "args": ["-y", "pkg"]},
            "b": {"command": "/usr/bin/env", "args": []}
        }}"#;
        let registry = ServerRegistry::parse(json, |_| false).unwrap();
        assert_eq!(registry.names(), vec!["b"]);
    }

    #[test]
    fn test_empty_registry_is_ok() {
        let registry = ServerRegistry::parse("{}", all_runtimes).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = ServerRegistry::parse("{not json", all_runtimes).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_rejects_non_json_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = ServerRegistry::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("not a .json file"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"mcp_servers": {{"echo": {{"command": "/bin/cat", "args": []}}}}}}"#
        )
        .unwrap();
        let registry = ServerRegistry::load(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().command, "/bin/cat");
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = ServerRegistry::from_specs([ServerSpec::new("a", "x", &[])]);
        registry.insert(ServerSpec::new("b", "y", &[]));
        assert_eq!(registry.len(), 2);
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.names(), vec!["b"]);
    }
}
