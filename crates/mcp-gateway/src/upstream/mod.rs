//! Upstream transports: one instance per upstream MCP server.
//!
//! Each transport owns a connection state machine
//! (`New → Connecting → Ready → Closing → Closed | Failed`), a tool list,
//! and the fan-out of `tools/call` requests. The [`TransportManager`] owns
//! the set of transports derived from one config and routes calls by tool
//! name.

pub mod http;
pub mod manager;
pub mod rpc;
pub mod sse;
pub mod stdio;
pub mod streamable;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use manager::TransportManager;

use crate::error::{TransportError, TransportResult};
use crate::protocol::{CallToolParams, CallToolResult, RequestInfo, StreamChunk, ToolInfo};

/// Connection state of a transport. At most one live connection exists per
/// transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    New,
    Connecting,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl TransportStatus {
    /// True when calls can be dispatched without connecting first.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// A lazily produced sequence of result chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = TransportResult<StreamChunk>> + Send>>;

/// Wire adapter for one upstream MCP server (or HTTP tool group).
#[async_trait]
pub trait Transport: Send + Sync {
    /// The upstream server name from the config.
    fn name(&self) -> &str;

    /// Current connection state.
    async fn status(&self) -> TransportStatus;

    /// True when calls should be surfaced as chunk streams.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Establish the connection and run the MCP handshake.
    async fn connect(&self) -> TransportResult<()>;

    /// Discover the upstream's tools (`tools/list`).
    async fn fetch_tools(&self) -> TransportResult<Vec<ToolInfo>>;

    /// Invoke a tool and await the complete result.
    async fn call_tools(
        &self,
        params: CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult>;

    /// Invoke a tool, yielding chunks. The default wraps the complete
    /// result in a single final chunk; streaming transports override it.
    async fn call_tools_streaming(
        &self,
        params: CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<ChunkStream> {
        let result = self.call_tools(params, request_info).await?;
        let chunk = StreamChunk::final_from_result(&result);
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    /// Tear the connection down and release resources.
    async fn close(&self) -> TransportResult<()>;
}

/// Transports that expose their JSON-RPC core, so the streamable wrapper
/// can observe individual response chunks.
#[async_trait]
pub trait RpcTransport: Transport {
    /// The live JSON-RPC client, connecting on demand.
    async fn rpc_handle(&self) -> TransportResult<std::sync::Arc<rpc::RpcClient>>;
}

/// Map an upstream JSON-RPC error object to a [`TransportError`].
pub(crate) fn upstream_error(error: &crate::protocol::JsonRpcError) -> TransportError {
    TransportError::upstream(error.code, error.message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_readiness() {
        assert!(TransportStatus::Ready.is_ready());
        assert!(!TransportStatus::New.is_ready());
        assert!(!TransportStatus::Failed.is_ready());
    }
}
