//! Minimal stdio tool server for smoke checks and integration tests.
//!
//! Tools:
//! - `echo {text}`          one text item
//! - `sleep {ms}`           waits, then replies "slept {ms}ms"
//! - `fail {message}`       `isError: true`
//! - `empty`                no content
//! - `image`                one base64 image item
//! - `env {name}`           value of an environment variable
//! - `list_count`           how many `tools/list` requests this process saw
//! - `crash`                exits without replying
//! - `garbage`              replies with a line that is not JSON

use std::io::{BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

use vtube_bridge::logging::{self, LogTarget};
use vtube_bridge::mcp_client::types::{error_codes, PROTOCOL_VERSION};

fn main() {
    logging::init_tracing(LogTarget::Stderr);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    let mut list_count = 0u64;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable request");
                continue;
            }
        };

        // Notifications carry no id and get no reply.
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        tracing::debug!(%method, "request");

        let reply = match method {
            "initialize" => ok(
                &id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION")}
                }),
            ),
            "tools/list" => {
                list_count += 1;
                ok(&id, json!({ "tools": tool_list() }))
            }
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                match name {
                    "crash" => std::process::exit(3),
                    "garbage" => "this is not json-rpc\n".to_string(),
                    _ => call_tool(&id, name, &args, list_count),
                }
            }
            other => err(
                &id,
                error_codes::METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
            ),
        };

        if stdout.write_all(reply.as_bytes()).and_then(|()| stdout.flush()).is_err() {
            break;
        }
    }
}

fn call_tool(id: &Value, name: &str, args: &Value, list_count: u64) -> String {
    let text_arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or("").to_string();

    match name {
        "echo" => ok(id, text_content(&text_arg("text"))),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            ok(id, text_content(&format!("slept {ms}ms")))
        }
        "fail" => ok(
            id,
            json!({
                "content": [{"type": "text", "text": text_arg("message")}],
                "isError": true
            }),
        ),
        "empty" => ok(id, json!({ "content": [] })),
        "image" => ok(
            id,
            json!({
                "content": [{"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"}]
            }),
        ),
        "env" => {
            let value = std::env::var(text_arg("name")).unwrap_or_default();
            ok(id, text_content(&value))
        }
        "list_count" => ok(id, text_content(&list_count.to_string())),
        other => err(id, error_codes::INVALID_PARAMS, &format!("unknown tool: {other}")),
    }
}

fn tool_list() -> Value {
    let names = [
        ("echo", "Echo the text argument"),
        ("sleep", "Sleep for ms milliseconds"),
        ("fail", "Report a tool-level error"),
        ("empty", "Return no content"),
        ("image", "Return an image item"),
        ("env", "Read an environment variable"),
        ("list_count", "Count tools/list requests"),
        ("crash", "Exit immediately"),
        ("garbage", "Reply with a malformed line"),
    ];
    Value::Array(
        names
            .iter()
            .map(|(name, description)| {
                json!({
                    "name": name,
                    "description": description,
                    "inputSchema": {"type": "object"}
                })
            })
            .collect(),
    )
}

fn text_content(text: &str) -> Value {
    json!({ "content": [{"type": "text", "text": text}] })
}

fn ok(id: &Value, result: Value) -> String {
    line(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn err(id: &Value, code: i64, message: &str) -> String {
    line(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    }))
}

fn line(value: Value) -> String {
    format!("{value}\n")
}
