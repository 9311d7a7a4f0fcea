//! MCP wire types: JSON-RPC 2.0 envelopes, tool descriptors, call results,
//! and streaming chunks.
//!
//! Field names follow the MCP schema (camelCase on the wire). The same types
//! are used on both the client-facing and upstream-facing sides of the
//! gateway.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MCP protocol revision the gateway negotiates by default.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC method names recognized by the gateway.
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
    /// Prefix shared by all notification methods.
    pub const NOTIFICATION_PREFIX: &str = "notifications/";
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Build a request with the given id, method and params.
    #[must_use]
    pub fn new(
        id: Option<serde_json::Value>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self { jsonrpc: "2.0".to_string(), method: method.into(), params, id }
    }

    /// A request without an id is a notification.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    /// JSON-RPC version constant.
    const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }

    #[must_use]
    pub fn error_with_data(
        id: Option<serde_json::Value>,
        code: i32,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: Some(data) }),
            id,
        }
    }

    /// True when the response carries an error object.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Tool descriptor in the `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Parameters of a `tools/call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// One content block of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

impl ToolContent {
    /// Build a text content block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The text payload of this block.
    #[must_use]
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
        }
    }
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    /// A successful single-text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self { content: vec![ToolContent::text(text)], is_error: false }
    }

    /// An error result carrying a single text block.
    #[must_use]
    pub fn error_text(text: impl Into<String>) -> Self {
        Self { content: vec![ToolContent::text(text)], is_error: true }
    }
}

/// One chunk of a streaming tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    #[serde(rename = "chunkId")]
    pub chunk_id: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "isFinal")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl StreamChunk {
    /// Build a chunk stamped with the current time.
    #[must_use]
    pub fn new(content: impl Into<String>, chunk_id: u64, is_final: bool) -> Self {
        Self {
            content: content.into(),
            chunk_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_final,
            metadata: None,
        }
    }

    /// A lone final chunk wrapping a complete result.
    #[must_use]
    pub fn final_from_result(result: &CallToolResult) -> Self {
        let content = result
            .content
            .iter()
            .map(ToolContent::as_text)
            .collect::<Vec<_>>()
            .join("");
        Self::new(content, 0, true)
    }
}

/// Request context captured when a session is created, frozen for its
/// lifetime. Tool templates may reference these fields via `request.*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub queries: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
}

/// The `initialize` result advertised to clients.
#[must_use]
pub fn initialize_result(protocol_version: &str, server_name: &str) -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": {
                "listChanged": false
            }
        },
        "serverInfo": {
            "name": server_name,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
