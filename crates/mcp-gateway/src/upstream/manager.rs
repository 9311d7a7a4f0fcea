//! Transport manager: owns the transports derived from one config and
//! routes tool calls by name.
//!
//! Tool discovery applies the collision rule: servers are consulted in
//! `servers + http_servers` order and the first one contributing a tool
//! name wins; later duplicates are dropped with a warning. The manager
//! never retries a call across transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::RwLock;

use crate::config::defaults;
use crate::error::{TransportError, TransportResult};
use crate::model::{ConnectPolicy, McpConfig, ServerType};
use crate::protocol::{CallToolParams, CallToolResult, RequestInfo, ToolInfo};
use crate::upstream::http::HttpToolTransport;
use crate::upstream::sse::SseTransport;
use crate::upstream::stdio::StdioTransport;
use crate::upstream::streamable::StreamableTransport;
use crate::upstream::{ChunkStream, Transport};

/// Cache key for the aggregated tool list.
const TOOLS_KEY: &str = "tools";

struct Entry {
    name: String,
    policy: ConnectPolicy,
    transport: Arc<dyn Transport>,
}

/// The set of transports for one activated config.
pub struct TransportManager {
    entries: Vec<Entry>,
    /// tool name -> index into `entries`; filled by discovery.
    tool_index: RwLock<HashMap<String, usize>>,
    tool_cache: Cache<String, Arc<Vec<ToolInfo>>>,
    stop_timeout: Duration,
}

impl TransportManager {
    /// Build transports for every server and HTTP server in the config.
    ///
    /// # Errors
    ///
    /// Returns a transport error when a client cannot be constructed.
    pub fn build(config: &McpConfig, call_timeout: Duration) -> TransportResult<Self> {
        let mut entries = Vec::new();

        for server in &config.servers {
            let transport: Arc<dyn Transport> = match server.server_type {
                ServerType::Sse => {
                    let lower = Arc::new(SseTransport::new(&server.name, &server.url, call_timeout)?);
                    if server.streamable {
                        Arc::new(StreamableTransport::new(lower, call_timeout))
                    } else {
                        lower
                    }
                }
                ServerType::Stdio => {
                    let lower = Arc::new(StdioTransport::new(
                        &server.name,
                        &server.command,
                        server.args.clone(),
                        server.preinstalled,
                        call_timeout,
                    ));
                    if server.streamable {
                        Arc::new(StreamableTransport::new(lower, call_timeout))
                    } else {
                        lower
                    }
                }
            };
            entries.push(Entry {
                name: server.name.clone(),
                policy: server.policy,
                transport,
            });
        }

        for http_server in &config.http_servers {
            let mut tools = Vec::new();
            for tool_name in &http_server.tools {
                match config.tool(tool_name) {
                    Some(tool) => tools.push(tool.clone()),
                    None => {
                        tracing::warn!(
                            server = %http_server.name,
                            tool = %tool_name,
                            "http server references unknown tool, skipped"
                        );
                    }
                }
            }
            entries.push(Entry {
                name: http_server.name.clone(),
                // HTTP tool groups are connectionless.
                policy: ConnectPolicy::OnDemand,
                transport: Arc::new(HttpToolTransport::new(http_server, tools, call_timeout)?),
            });
        }

        Ok(Self {
            entries,
            tool_index: RwLock::new(HashMap::new()),
            tool_cache: Cache::builder()
                .max_capacity(4)
                .time_to_live(defaults::TOOL_CACHE_TTL)
                .build(),
            stop_timeout: defaults::STOP_TIMEOUT,
        })
    }

    /// Connect every `on_start` transport. Activation fails on the first
    /// connect failure; already connected transports are left running for
    /// the caller to stop.
    pub async fn start(&self) -> TransportResult<()> {
        for entry in &self.entries {
            if entry.policy == ConnectPolicy::OnStart {
                entry.transport.connect().await.map_err(|err| {
                    tracing::error!(upstream = %entry.name, error = %err, "on_start connect failed");
                    err
                })?;
            }
        }
        Ok(())
    }

    /// The union of every transport's tool list with first-wins collision
    /// resolution, in deterministic server order.
    pub async fn fetch_all_tools(&self) -> TransportResult<Vec<ToolInfo>> {
        if let Some(cached) = self.tool_cache.get(TOOLS_KEY).await {
            return Ok(cached.as_ref().clone());
        }

        let mut index = HashMap::new();
        let mut all_tools = Vec::new();

        for (position, entry) in self.entries.iter().enumerate() {
            let tools = match entry.transport.fetch_tools().await {
                Ok(tools) => tools,
                Err(err) => {
                    tracing::warn!(
                        upstream = %entry.name,
                        error = %err,
                        "tool discovery failed, server skipped"
                    );
                    continue;
                }
            };

            for tool in tools {
                if index.contains_key(&tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        loser = %entry.name,
                        "duplicate tool name, keeping the earlier server's tool"
                    );
                    continue;
                }
                index.insert(tool.name.clone(), position);
                all_tools.push(tool);
            }
        }

        *self.tool_index.write().await = index;
        self.tool_cache.insert(TOOLS_KEY.to_string(), Arc::new(all_tools.clone())).await;
        Ok(all_tools)
    }

    async fn owner(&self, tool_name: &str) -> TransportResult<Arc<dyn Transport>> {
        if let Some(position) = self.tool_index.read().await.get(tool_name) {
            return Ok(Arc::clone(&self.entries[*position].transport));
        }
        // Cold index: run discovery once, then retry the lookup.
        self.fetch_all_tools().await?;
        self.tool_index
            .read()
            .await
            .get(tool_name)
            .map(|position| Arc::clone(&self.entries[*position].transport))
            .ok_or_else(|| TransportError::tool_not_found(tool_name))
    }

    /// Route a call to the transport owning the tool.
    pub async fn call_tool(
        &self,
        params: CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult> {
        let transport = self.owner(&params.name).await?;
        transport.call_tools(params, request_info).await
    }

    /// Route a streaming call to the transport owning the tool.
    pub async fn call_tool_streaming(
        &self,
        params: CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<ChunkStream> {
        let transport = self.owner(&params.name).await?;
        transport.call_tools_streaming(params, request_info).await
    }

    /// True when the tool's owning transport surfaces chunk streams.
    pub async fn is_streaming(&self, tool_name: &str) -> bool {
        match self.owner(tool_name).await {
            Ok(transport) => transport.is_streaming(),
            Err(_) => false,
        }
    }

    /// Drop the cached tool list so the next `tools/list` re-discovers.
    pub async fn invalidate_tools(&self) {
        self.tool_cache.invalidate(TOOLS_KEY).await;
        self.tool_index.write().await.clear();
    }

    /// Close all transports. Each close is bounded by the stop timeout and
    /// abandoned when it exceeds it.
    pub async fn stop(&self) {
        for entry in &self.entries {
            match tokio::time::timeout(self.stop_timeout, entry.transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(upstream = %entry.name, error = %err, "transport close failed");
                }
                Err(_) => {
                    tracing::warn!(upstream = %entry.name, "transport close timed out, abandoned");
                }
            }
        }
        self.invalidate_tools().await;
    }

    /// Upstream server names in registration order.
    #[must_use]
    pub fn server_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("transports", &self.entries.len())
            .finish()
    }
}
