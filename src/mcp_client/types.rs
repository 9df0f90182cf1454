//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, server launch specs, and the normalized
//! tool listing / tool result shapes every bridge strategy returns.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Protocol Constants ──────────────────────────────────────────────────────

/// Protocol revision announced in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name announced in `clientInfo`.
pub const CLIENT_NAME: &str = "vtube-bridge";

/// Default round-trip budget for a server without an explicit timeout.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(120);

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC request id. Numbers and strings are both valid on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: RequestId, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Serialize to a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Build the params of the `initialize` request.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Server Launch Specs ─────────────────────────────────────────────────────

/// How to launch one named tool server. Owned by the registry, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Overrides layered on top of the inherited process environment.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl ServerSpec {
    /// Spec with no env overrides and the default timeout.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            timeout: DEFAULT_SERVER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

// ─── Tool Listing ────────────────────────────────────────────────────────────

/// A tool exposed by a server, tagged with the server it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub server_name: String,
}

/// Servers may send `"description": null`; read it as empty.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

// ─── Tool Results ────────────────────────────────────────────────────────────

/// Type tag of a normalized content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Error,
    Image,
    Audio,
    Resource,
    Data,
    #[serde(untagged)]
    Other(String),
}

impl ContentType {
    /// Map a wire `type` string onto the enum.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "text" => ContentType::Text,
            "error" => ContentType::Error,
            "image" => ContentType::Image,
            "audio" => ContentType::Audio,
            "resource" => ContentType::Resource,
            "data" => ContentType::Data,
            other => ContentType::Other(other.to_string()),
        }
    }
}

/// One entry of [`ToolResult::content_items`]. Absent attributes are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::with_kind(ContentType::Text, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::with_kind(ContentType::Error, text)
    }

    fn with_kind(kind: ContentType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: Some(text.into()),
            data: None,
            mime_type: None,
            url: None,
            alt_text: None,
        }
    }
}

/// Uniform result of a tool call. `content_items` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub content_items: Vec<ContentItem>,
}

impl ToolResult {
    /// Whether the remote tool signaled failure.
    pub fn is_error(&self) -> bool {
        self.content_items
            .iter()
            .any(|item| item.kind == ContentType::Error)
    }

    /// Text of the first content item, if it has one.
    pub fn first_text(&self) -> Option<&str> {
        self.content_items.first().and_then(|item| item.text.as_deref())
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/list\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_request_line_with_string_id() {
        let params = serde_json::json!({"name": "echo", "arguments": {"text": "hi"}});
        let req = JsonRpcRequest::new(RequestId::Text("abc".into()), "tools/call", Some(params));
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"id\":\"abc\""));
    }

    #[test]
    fn test_response_with_string_and_numeric_ids() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"x-1","result":{}}"#).unwrap();
        assert_eq!(resp.id, RequestId::Text("x-1".into()));

        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(resp.id, RequestId::Number(7));
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_initialize_params_shape() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
        assert!(params["capabilities"].is_object());
    }

    #[test]
    fn test_tool_descriptor_defaults() {
        let tool: ToolDescriptor = serde_json::from_str(r#"{"name": "echo"}"#).unwrap();
        assert_eq!(tool.description, "");
        assert!(tool.input_schema.is_null());
        assert_eq!(tool.server_name, "");
    }

    #[test]
    fn test_null_description_does_not_fail_listing() {
        let listing: ListToolsResult = serde_json::from_str(
            r#"{"tools":[{"name":"a","description":null,"inputSchema":{}},{"name":"b","description":"B"}]}"#,
        )
        .unwrap();
        assert_eq!(listing.tools.len(), 2);
        assert_eq!(listing.tools[0].description, "");
        assert_eq!(listing.tools[1].description, "B");
    }

    #[test]
    fn test_content_item_serializes_camel_case_and_skips_none() {
        let item = ContentItem {
            kind: ContentType::Image,
            text: None,
            data: Some(serde_json::json!("aGVsbG8=")),
            mime_type: Some("image/png".into()),
            url: None,
            alt_text: Some("a cat".into()),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["mimeType"], "image/png");
        assert_eq!(json["altText"], "a cat");
        assert!(json.get("text").is_none());
        assert!(json.get("url").is_none());
    }

    #[test]
    fn test_unknown_content_type_round_trips_as_string() {
        assert_eq!(
            ContentType::from_wire("resource_link"),
            ContentType::Other("resource_link".into())
        );
        let json = serde_json::to_value(ContentType::Other("resource_link".into())).unwrap();
        assert_eq!(json, "resource_link");
    }

    #[test]
    fn test_server_spec_builder() {
        let spec = ServerSpec::new("time", "uvx", &["mcp-server-time"])
            .with_env("TZ", "UTC")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(spec.args, vec!["mcp-server-time"]);
        assert_eq!(spec.env.get("TZ").map(String::as_str), Some("UTC"));
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert_eq!(
            ServerSpec::new("a", "b", &[]).timeout,
            DEFAULT_SERVER_TIMEOUT
        );
    }
}
