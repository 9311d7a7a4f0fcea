//! SSE client transport for upstream MCP servers.
//!
//! Opens a long-lived `text/event-stream` GET to the upstream `url`. The
//! upstream announces a message endpoint in its first `endpoint` event;
//! JSON-RPC requests are POSTed there and responses arrive as `message`
//! events on the stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    CallToolParams, CallToolResult, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestInfo,
    ToolInfo, method,
};
use crate::upstream::rpc::{RpcClient, parse_call_result, parse_tools_result};
use crate::upstream::{RpcTransport, Transport, TransportStatus, upstream_error};

/// Buffered frames between the byte parser and the dispatcher.
const FRAME_BUFFER: usize = 64;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// SSE-backed upstream transport.
pub struct SseTransport {
    name: String,
    url: String,
    http: reqwest::Client,
    call_timeout: Duration,
    status: Arc<RwLock<TransportStatus>>,
    live: Mutex<Option<Live>>,
}

struct Live {
    rpc: Arc<RpcClient>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    parser: JoinHandle<()>,
}

impl Live {
    fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
        self.parser.abort();
    }
}

impl SseTransport {
    /// Build a transport for the upstream `url`. No I/O happens here.
    ///
    /// # Errors
    ///
    /// Returns a connect error when the HTTP client cannot be constructed.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        call_timeout: Duration,
    ) -> TransportResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::connect(format!("build http client: {e}")))?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            http,
            call_timeout,
            status: Arc::new(RwLock::new(TransportStatus::New)),
            live: Mutex::new(None),
        })
    }

    async fn set_status(&self, status: TransportStatus) {
        *self.status.write().await = status;
    }

    async fn rpc(&self) -> TransportResult<Arc<RpcClient>> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| Arc::clone(&live.rpc))
            .ok_or_else(|| TransportError::not_connected(&self.name))
    }

    async fn ensure_connected(&self) -> TransportResult<Arc<RpcClient>> {
        if self.status.read().await.is_ready() {
            return self.rpc().await;
        }
        self.connect().await?;
        self.rpc().await
    }

    async fn handshake(&self) -> TransportResult<Live> {
        let response = self
            .http
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("open sse stream: {e}")))?;

        if !response.status().is_success() {
            return Err(TransportError::connect(format!(
                "sse stream returned HTTP {}",
                response.status()
            )));
        }

        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_BUFFER);
        let byte_stream = response.bytes_stream();
        let parser = tokio::spawn(async move {
            parse_sse_stream(byte_stream, frames_tx).await;
        });

        // The upstream's first event names the JSON-RPC POST endpoint.
        let endpoint = tokio::time::timeout(self.call_timeout, async {
            while let Some(frame) = frames_rx.recv().await {
                if frame.event == "endpoint" {
                    return Some(frame.data);
                }
            }
            None
        })
        .await
        .map_err(|_| TransportError::connect("no endpoint event before timeout"))?
        .ok_or_else(|| TransportError::connect("sse stream closed before endpoint event"))?;

        let endpoint = resolve_endpoint(&self.url, endpoint.trim())?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<JsonRpcRequest>(FRAME_BUFFER);
        let rpc = RpcClient::new(&self.name, outbound_tx, self.call_timeout);

        let writer_http = self.http.clone();
        let writer_name = self.name.clone();
        let writer = tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                match writer_http.post(&endpoint).json(&request).send().await {
                    Ok(response) if !response.status().is_success() => {
                        tracing::warn!(
                            upstream = %writer_name,
                            status = %response.status(),
                            "message post rejected"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(upstream = %writer_name, error = %err, "message post failed");
                    }
                }
            }
        });

        let reader_rpc = Arc::clone(&rpc);
        let reader_status = Arc::clone(&self.status);
        let reader_name = self.name.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                match frame.event.as_str() {
                    "ping" => {}
                    "endpoint" => {}
                    _ => match serde_json::from_str::<JsonRpcResponse>(&frame.data) {
                        Ok(response) => reader_rpc.dispatch(response).await,
                        Err(err) => {
                            tracing::warn!(
                                upstream = %reader_name,
                                error = %err,
                                "unparseable sse message, dropped"
                            );
                        }
                    },
                }
            }
            tracing::warn!(upstream = %reader_name, "sse stream ended");
            *reader_status.write().await = TransportStatus::Failed;
            reader_rpc.fail_all().await;
        });

        let live = Live { rpc: Arc::clone(&rpc), reader, writer, parser };

        // MCP handshake over the fresh channel.
        let init = rpc
            .request(
                method::INITIALIZE,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-gateway",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await;
        match init {
            Ok(response) => {
                if let Some(error) = &response.error {
                    live.shutdown();
                    return Err(upstream_error(error));
                }
            }
            Err(err) => {
                live.shutdown();
                return Err(TransportError::connect(format!("initialize failed: {err}")));
            }
        }
        if let Err(err) = rpc.notify(method::INITIALIZED, serde_json::json!({})).await {
            live.shutdown();
            return Err(err);
        }

        Ok(live)
    }

    async fn do_call(&self, params: &CallToolParams) -> TransportResult<CallToolResult> {
        let rpc = self.rpc().await?;
        let response = rpc
            .request(
                method::TOOLS_CALL,
                serde_json::json!({"name": params.name, "arguments": params.arguments}),
            )
            .await?;
        parse_call_result(&response)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> TransportStatus {
        *self.status.read().await
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut live = self.live.lock().await;
        if let Some(previous) = live.take() {
            previous.shutdown();
        }
        self.set_status(TransportStatus::Connecting).await;

        match self.handshake().await {
            Ok(fresh) => {
                *live = Some(fresh);
                self.set_status(TransportStatus::Ready).await;
                tracing::info!(upstream = %self.name, url = %self.url, "sse transport connected");
                Ok(())
            }
            Err(err) => {
                self.set_status(TransportStatus::Failed).await;
                Err(err)
            }
        }
    }

    async fn fetch_tools(&self) -> TransportResult<Vec<ToolInfo>> {
        let rpc = self.ensure_connected().await?;
        let response = rpc.request(method::TOOLS_LIST, serde_json::json!({})).await?;
        parse_tools_result(&response)
    }

    async fn call_tools(
        &self,
        params: CallToolParams,
        _request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult> {
        self.ensure_connected().await?;
        match self.do_call(&params).await {
            Err(err) if err.is_retryable() => {
                tracing::warn!(upstream = %self.name, error = %err, "retrying after reconnect");
                self.connect().await?;
                self.do_call(&params).await
            }
            other => other,
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.set_status(TransportStatus::Closing).await;
        if let Some(live) = self.live.lock().await.take() {
            live.rpc.fail_all().await;
            live.shutdown();
        }
        self.set_status(TransportStatus::Closed).await;
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for SseTransport {
    async fn rpc_handle(&self) -> TransportResult<Arc<RpcClient>> {
        self.ensure_connected().await
    }
}

/// Resolve the endpoint announced by the upstream against the stream URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> TransportResult<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = url::Url::parse(base)
        .map_err(|e| TransportError::connect(format!("invalid upstream url: {e}")))?;
    base.join(endpoint)
        .map(String::from)
        .map_err(|e| TransportError::connect(format!("invalid endpoint '{endpoint}': {e}")))
}

/// Incrementally parse an SSE byte stream into frames. Events are separated
/// by blank lines; multi-line `data:` fields are joined with newlines.
pub async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    frames: mpsc::Sender<SseFrame>,
) {
    use futures::StreamExt;

    let mut buffer = String::new();
    tokio::pin!(byte_stream);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(_) => break,
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);

        while let Some(pos) = buffer.find("\n\n") {
            let block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            if let Some(frame) = parse_frame(&block) {
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }

    if !buffer.is_empty() {
        if let Some(frame) = parse_frame(&buffer) {
            let _ = frames.send(frame).await;
        }
    }
}

fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut event = String::new();
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        }
        // `id:` and `retry:` fields and `:` comments are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame { event, data: data_lines.join("\n") })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_frames(body: &[u8]) -> Vec<SseFrame> {
        let (tx, mut rx) = mpsc::channel(16);
        let chunks: Vec<reqwest::Result<Bytes>> = vec![Ok(Bytes::copy_from_slice(body))];
        parse_sse_stream(futures::stream::iter(chunks), tx).await;

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_parse_single_event() {
        let frames = collect_frames(b"event: endpoint\ndata: /message?session_id=1\n\n").await;
        assert_eq!(
            frames,
            vec![SseFrame { event: "endpoint".into(), data: "/message?session_id=1".into() }]
        );
    }

    #[tokio::test]
    async fn test_parse_two_events_in_one_chunk() {
        let frames = collect_frames(b"data: first\n\ndata: second\n\n").await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "first");
        assert_eq!(frames[1].data, "second");
    }

    #[tokio::test]
    async fn test_parse_event_split_across_chunks() {
        let (tx, mut rx) = mpsc::channel(16);
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"event: mess")),
            Ok(Bytes::from_static(b"age\ndata: {\"a\"")),
            Ok(Bytes::from_static(b": 1}\n\n")),
        ];
        parse_sse_stream(futures::stream::iter(chunks), tx).await;

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.data, "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_multiline_data_joined() {
        let frames = collect_frames(b"data: line1\ndata: line2\n\n").await;
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[tokio::test]
    async fn test_comment_only_block_skipped() {
        let frames = collect_frames(b": keepalive\n\ndata: real\n\n").await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "real");
    }

    #[test]
    fn test_resolve_endpoint() {
        assert_eq!(
            resolve_endpoint("http://up.example/sse", "/message?session_id=5").unwrap(),
            "http://up.example/message?session_id=5"
        );
        assert_eq!(
            resolve_endpoint("http://up.example/sse", "https://other.example/m").unwrap(),
            "https://other.example/m"
        );
    }
}
