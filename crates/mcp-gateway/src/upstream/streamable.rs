//! Streamable wrapper: exposes a chunked call API over an already
//! connected SSE or STDIO transport.
//!
//! A `tools/call` on the wrapped transport may answer with a sequence of
//! responses whose results carry `{content, chunkId, isFinal}`; the wrapper
//! surfaces them as [`StreamChunk`]s with strictly increasing ids,
//! terminating at `isFinal: true`. A plain single response becomes one
//! final chunk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    CallToolParams, CallToolResult, JsonRpcResponse, RequestInfo, StreamChunk, ToolInfo, method,
};
use crate::upstream::rpc::parse_call_result;
use crate::upstream::{ChunkStream, RpcTransport, Transport, TransportStatus, upstream_error};

/// Chunk-streaming adapter over a lower transport.
pub struct StreamableTransport {
    inner: Arc<dyn RpcTransport>,
    call_timeout: Duration,
}

impl StreamableTransport {
    /// Wrap a lower transport.
    #[must_use]
    pub fn new(inner: Arc<dyn RpcTransport>, call_timeout: Duration) -> Self {
        Self { inner, call_timeout }
    }
}

#[async_trait]
impl Transport for StreamableTransport {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn status(&self) -> TransportStatus {
        self.inner.status().await
    }

    fn is_streaming(&self) -> bool {
        true
    }

    async fn connect(&self) -> TransportResult<()> {
        self.inner.connect().await
    }

    async fn fetch_tools(&self) -> TransportResult<Vec<ToolInfo>> {
        self.inner.fetch_tools().await
    }

    async fn call_tools(
        &self,
        params: CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult> {
        self.inner.call_tools(params, request_info).await
    }

    async fn call_tools_streaming(
        &self,
        params: CallToolParams,
        _request_info: &RequestInfo,
    ) -> TransportResult<ChunkStream> {
        let rpc = self.inner.rpc_handle().await?;
        let mut responses = rpc
            .request_stream(
                method::TOOLS_CALL,
                serde_json::json!({"name": params.name, "arguments": params.arguments}),
            )
            .await?;

        let call_timeout = self.call_timeout;
        let stream = async_stream::stream! {
            let mut next_chunk_id = 0u64;
            loop {
                let response = match tokio::time::timeout(call_timeout, responses.recv()).await {
                    Ok(Some(response)) => response,
                    Ok(None) => {
                        // Channel closed without a final chunk: the call was
                        // torn down underneath us.
                        yield Err(TransportError::Cancelled);
                        break;
                    }
                    Err(_) => {
                        yield Err(TransportError::Timeout(call_timeout));
                        break;
                    }
                };

                match into_chunk(&response, next_chunk_id) {
                    Ok(chunk) => {
                        let is_final = chunk.is_final;
                        next_chunk_id += 1;
                        yield Ok(chunk);
                        if is_final {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }
}

/// Map one JSON-RPC response onto a chunk, renumbering ids locally so the
/// sequence seen by clients is strictly increasing regardless of upstream
/// numbering.
fn into_chunk(response: &JsonRpcResponse, chunk_id: u64) -> TransportResult<StreamChunk> {
    if let Some(error) = &response.error {
        return Err(upstream_error(error));
    }
    let result = response
        .result
        .as_ref()
        .ok_or_else(|| TransportError::protocol("chunk response without result"))?;

    if result.get("chunkId").is_some() {
        let mut chunk: StreamChunk = serde_json::from_value(result.clone())
            .map_err(|e| TransportError::protocol(format!("malformed chunk: {e}")))?;
        chunk.chunk_id = chunk_id;
        if chunk.timestamp == 0 {
            chunk.timestamp = chrono::Utc::now().timestamp_millis();
        }
        return Ok(chunk);
    }

    // A plain result is the whole answer: one final chunk.
    let result = parse_call_result(response)?;
    let mut chunk = StreamChunk::final_from_result(&result);
    chunk.chunk_id = chunk_id;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_chunk_renumbers_ids() {
        let response = JsonRpcResponse::success(
            Some(serde_json::json!(1)),
            serde_json::json!({"content": "part", "chunkId": 77, "isFinal": false}),
        );
        let chunk = into_chunk(&response, 3).unwrap();
        assert_eq!(chunk.chunk_id, 3);
        assert_eq!(chunk.content, "part");
        assert!(!chunk.is_final);
        assert!(chunk.timestamp > 0);
    }

    #[test]
    fn test_into_chunk_wraps_plain_result_as_final() {
        let response = JsonRpcResponse::success(
            Some(serde_json::json!(1)),
            serde_json::json!({"content": [{"type": "text", "text": "whole"}]}),
        );
        let chunk = into_chunk(&response, 0).unwrap();
        assert!(chunk.is_final);
        assert_eq!(chunk.content, "whole");
    }

    #[test]
    fn test_into_chunk_surfaces_upstream_error() {
        let response = JsonRpcResponse::error(Some(serde_json::json!(1)), -32000, "boom");
        assert!(matches!(
            into_chunk(&response, 0),
            Err(TransportError::Upstream { code: -32000, .. })
        ));
    }
}
