//! Tool result normalization.
//!
//! Converts whatever a server sends back for `tools/call` into the uniform
//! [`ToolResult`] shape. Pure functions, shared by every bridge strategy.

use super::errors::McpError;
use super::types::{ContentItem, ContentType, JsonRpcError, JsonRpcResponse, ToolResult};

/// Fallback text when an error response carries no usable message.
pub const UNKNOWN_SERVER_ERROR: &str = "Unknown server error";

/// Normalize a complete JSON-RPC response to `tools/call`.
///
/// A JSON-RPC `error` becomes a tool-level error item, not an `Err`.
/// A response with neither `result` nor `error` is a `ProtocolError`.
pub fn normalize_call_response(
    server: &str,
    response: JsonRpcResponse,
) -> Result<ToolResult, McpError> {
    if let Some(err) = response.error {
        return Ok(from_rpc_error(&err));
    }
    match response.result {
        Some(result) => Ok(normalize_tool_payload(&result)),
        None => Err(McpError::ProtocolError {
            server: server.to_string(),
            reason: "tools/call response missing both result and error".into(),
        }),
    }
}

/// Map a JSON-RPC error object to a single `error` content item.
pub fn from_rpc_error(err: &JsonRpcError) -> ToolResult {
    let message = if err.message.trim().is_empty() {
        UNKNOWN_SERVER_ERROR.to_string()
    } else {
        err.message.clone()
    };
    ToolResult {
        metadata: serde_json::Map::new(),
        content_items: vec![ContentItem::error(message)],
    }
}

/// Normalize a `tools/call` result payload.
pub fn normalize_tool_payload(result: &serde_json::Value) -> ToolResult {
    let metadata = extract_metadata(result);

    let entries = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        let text = entries
            .first()
            .and_then(|first| first.get("text"))
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_SERVER_ERROR);
        tracing::warn!(error = text, "tool reported an error");
        return ToolResult {
            metadata,
            content_items: vec![ContentItem::error(text)],
        };
    }

    let mut content_items: Vec<ContentItem> = entries.iter().filter_map(flatten_entry).collect();

    if content_items.is_empty() {
        match result.as_str() {
            Some(text) => content_items.push(ContentItem::text(text)),
            None => {
                tracing::debug!("tool returned no content; substituting empty text item");
                content_items.push(ContentItem::text(""));
            }
        }
    }

    ToolResult {
        metadata,
        content_items,
    }
}

/// `_meta` (protocol field) or `metadata`, when it is an object.
fn extract_metadata(result: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    ["_meta", "metadata"]
        .iter()
        .find_map(|key| result.get(*key).and_then(|m| m.as_object()).cloned())
        .unwrap_or_default()
}

/// Flatten one content entry by probing the known attribute set.
fn flatten_entry(entry: &serde_json::Value) -> Option<ContentItem> {
    if let Some(text) = entry.as_str() {
        return Some(ContentItem::text(text));
    }
    let obj = entry.as_object()?;

    let kind = obj
        .get("type")
        .and_then(|t| t.as_str())
        .map(ContentType::from_wire)
        .unwrap_or(ContentType::Text);

    let string_attr = |key: &str| -> Option<String> {
        match obj.get(key)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    };

    Some(ContentItem {
        kind,
        text: string_attr("text"),
        data: obj.get("data").filter(|d| !d.is_null()).cloned(),
        mime_type: string_attr("mimeType"),
        url: string_attr("url"),
        alt_text: string_attr("altText"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
