//! Request/response correlation.
//!
//! Every strategy matches an outbound request to its reply by id:
//! - stdio connections read inbound lines on a background reader and wait
//!   on the channel for the matching id ([`await_response`]).
//! - the queue-based bridge publishes worker replies on a [`ResponseBoard`]
//!   where each caller thread picks up only its own reply.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;

use super::errors::McpError;
use super::types::{JsonRpcResponse, RequestId};

// ─── Request ID Generation ───────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique numeric request ID.
pub fn next_request_id() -> RequestId {
    RequestId::Number(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// Generate a UUID v4 string request ID.
pub fn uuid_request_id() -> RequestId {
    RequestId::Text(uuid::Uuid::new_v4().to_string())
}

// ─── Inbound Classification ──────────────────────────────────────────────────

/// A line read from a server's stdout that matters to a waiter.
#[derive(Debug)]
pub enum Inbound {
    Response(JsonRpcResponse),
    Malformed { line: String, reason: String },
}

/// Classify one stdout line.
///
/// Returns `None` for blank lines and for server-initiated messages
/// (notifications and requests carry a `method`), which no waiter expects.
pub fn classify_line(line: &str) -> Option<Inbound> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return Some(Inbound::Malformed {
                line: truncate(trimmed, 200),
                reason: format!("invalid JSON: {e}"),
            })
        }
    };

    if value.get("method").is_some() {
        tracing::debug!(line = %truncate(trimmed, 200), "skipping server-initiated message");
        return None;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => Some(Inbound::Response(resp)),
        Err(e) => Some(Inbound::Malformed {
            line: truncate(trimmed, 200),
            reason: format!("not a JSON-RPC response: {e}"),
        }),
    }
}

/// Discard anything already queued (late replies to abandoned requests).
pub fn drain_stale(server: &str, inbound: &mut UnboundedReceiver<Inbound>) {
    while let Ok(stale) = inbound.try_recv() {
        tracing::debug!(server, ?stale, "discarding stale inbound message");
    }
}

/// Wait for the response carrying `id`.
///
/// Responses for other ids are dropped. A malformed line or a closed stream
/// is a `ProtocolError` for this waiter. Callers bound the wait with
/// `tokio::time::timeout`; receiving from the channel is cancel-safe.
pub async fn await_response(
    server: &str,
    inbound: &mut UnboundedReceiver<Inbound>,
    id: &RequestId,
) -> Result<JsonRpcResponse, McpError> {
    loop {
        match inbound.recv().await {
            Some(Inbound::Response(resp)) if &resp.id == id => return Ok(resp),
            Some(Inbound::Response(resp)) => {
                tracing::debug!(server, expected = %id, got = %resp.id, "skipping response for another request");
            }
            Some(Inbound::Malformed { line, reason }) => {
                return Err(McpError::ProtocolError {
                    server: server.to_string(),
                    reason: format!("{reason} (line: {line})"),
                });
            }
            None => {
                return Err(McpError::ProtocolError {
                    server: server.to_string(),
                    reason: "server stdout closed (process may have exited)".into(),
                });
            }
        }
    }
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

// ─── Response Board ──────────────────────────────────────────────────────────

/// Shared response queue keyed by request id.
///
/// Any number of threads may wait concurrently. A waiter only ever removes
/// its own entry, so replies addressed to other waiters stay put until their
/// owner collects them. Ids whose waiter gave up are remembered and their
/// late replies are dropped on arrival.
pub struct ResponseBoard<K, T> {
    state: Mutex<BoardState<K, T>>,
    arrived: Condvar,
}

struct BoardState<K, T> {
    responses: HashMap<K, T>,
    abandoned: HashSet<K>,
}

impl<K: Eq + Hash + Clone, T> ResponseBoard<K, T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState {
                responses: HashMap::new(),
                abandoned: HashSet::new(),
            }),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState<K, T>> {
        // A waiter panicking mid-wait leaves the maps consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a response. Returns `false` if its waiter already gave up.
    pub fn publish(&self, id: K, value: T) -> bool {
        let mut state = self.lock();
        if state.abandoned.remove(&id) {
            return false;
        }
        state.responses.insert(id, value);
        drop(state);
        self.arrived.notify_all();
        true
    }

    /// Block until the response for `id` arrives or `timeout` elapses.
    pub fn wait_for(&self, id: &K, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(value) = state.responses.remove(id) {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                state.abandoned.insert(id.clone());
                return None;
            }
            state = match self.arrived.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Number of published responses not yet collected.
    pub fn uncollected(&self) -> usize {
        self.lock().responses.len()
    }
}

impl<K: Eq + Hash + Clone, T> Default for ResponseBoard<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
