//! Shared JSON-RPC request core for the SSE and STDIO transports.
//!
//! Outbound requests are queued onto a writer channel owned by the
//! transport; inbound responses are routed back to callers by the `id`
//! field. A request is either one-shot (a single response resolves it) or
//! streaming (responses accumulate on a channel until one carries
//! `isFinal: true` or an error).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolInfo};
use crate::upstream::upstream_error;

/// Buffered responses per streaming request.
const STREAM_BUFFER: usize = 32;

#[derive(Debug)]
enum Pending {
    Once(oneshot::Sender<JsonRpcResponse>),
    Stream(mpsc::Sender<JsonRpcResponse>),
}

/// Id-routing JSON-RPC client shared by wire-level transports.
#[derive(Debug)]
pub struct RpcClient {
    /// Upstream name, for error context.
    name: String,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    outbound: mpsc::Sender<JsonRpcRequest>,
    call_timeout: Duration,
}

impl RpcClient {
    /// Create a client writing requests onto `outbound`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        outbound: mpsc::Sender<JsonRpcRequest>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outbound,
            call_timeout,
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and await its single response.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> TransportResult<JsonRpcResponse> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, Pending::Once(tx));

        let request = JsonRpcRequest::new(Some(serde_json::json!(id)), method, params);
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::not_connected(&self.name));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout(self.call_timeout))
            }
        }
    }

    /// Send a request whose responses arrive as a chunk sequence. The
    /// returned receiver yields until a response carries `isFinal: true` or
    /// an error object.
    pub async fn request_stream(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> TransportResult<mpsc::Receiver<JsonRpcResponse>> {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.pending.lock().await.insert(id, Pending::Stream(tx));

        let request = JsonRpcRequest::new(Some(serde_json::json!(id)), method, params);
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::not_connected(&self.name));
        }

        Ok(rx)
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> TransportResult<()> {
        let request = JsonRpcRequest::new(None, method, params);
        self.outbound
            .send(request)
            .await
            .map_err(|_| TransportError::not_connected(&self.name))
    }

    /// Route one inbound response to its waiting caller. Unmatched ids are
    /// logged and dropped.
    pub async fn dispatch(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_ref().and_then(serde_json::Value::as_u64) else {
            tracing::debug!(upstream = %self.name, "response without numeric id, dropped");
            return;
        };

        let mut pending = self.pending.lock().await;
        match pending.remove(&id) {
            Some(Pending::Once(tx)) => {
                drop(pending);
                let _ = tx.send(response);
            }
            Some(Pending::Stream(tx)) => {
                let finished = response.is_error() || is_final_chunk(&response);
                if !finished {
                    pending.insert(id, Pending::Stream(tx.clone()));
                }
                drop(pending);
                let _ = tx.send(response).await;
            }
            None => {
                tracing::debug!(upstream = %self.name, id, "response for unknown request, dropped");
            }
        }
    }

    /// Drop all outstanding requests; their callers observe `Cancelled`.
    pub async fn fail_all(&self) {
        self.pending.lock().await.clear();
    }

    /// Number of in-flight requests (for tests and introspection).
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// A chunked response is final when its result says so; a plain result
/// (no chunk marker) is also terminal.
fn is_final_chunk(response: &JsonRpcResponse) -> bool {
    match &response.result {
        Some(result) => match result.get("isFinal") {
            Some(flag) => flag.as_bool().unwrap_or(true),
            None => true,
        },
        None => true,
    }
}

/// Extract the tool list from a `tools/list` response.
pub fn parse_tools_result(response: &JsonRpcResponse) -> TransportResult<Vec<ToolInfo>> {
    if let Some(error) = &response.error {
        return Err(upstream_error(error));
    }
    let result = response
        .result
        .as_ref()
        .ok_or_else(|| TransportError::protocol("tools/list response without result"))?;
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| TransportError::protocol("tools/list result without 'tools'"))?;
    serde_json::from_value(tools)
        .map_err(|e| TransportError::protocol(format!("malformed tool list: {e}")))
}

/// Extract a call result from a `tools/call` response. Results that do not
/// match the MCP shape are wrapped verbatim as text.
pub fn parse_call_result(response: &JsonRpcResponse) -> TransportResult<CallToolResult> {
    if let Some(error) = &response.error {
        return Err(upstream_error(error));
    }
    let result = response
        .result
        .as_ref()
        .ok_or_else(|| TransportError::protocol("tools/call response without result"))?;
    Ok(serde_json::from_value(result.clone())
        .unwrap_or_else(|_| CallToolResult::text(result.to_string())))
}
