//! Tests for MCP protocol JSON-RPC shapes.
//!
//! These tests verify the wire forms the gateway exchanges with clients
//! and upstreams.

use mcp_gateway::error::{GatewayError, TransportError, rpc_code};
use mcp_gateway::protocol::{
    CallToolParams, CallToolResult, JsonRpcRequest, JsonRpcResponse, StreamChunk, ToolContent,
    ToolInfo,
};
use serde_json::json;

// =============================================================================
// JSON-RPC Message Structure Tests
// =============================================================================

/// Test valid JSON-RPC request structure
#[test]
fn test_jsonrpc_request_structure() {
    let request: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "method": "tools/list",
        "id": 1
    }))
    .unwrap();

    assert_eq!(request.jsonrpc, "2.0");
    assert_eq!(request.method, "tools/list");
    assert_eq!(request.id, Some(json!(1)));
    assert!(!request.is_notification());
}

/// Test tool call request structure
#[test]
fn test_tool_call_request_structure() {
    let request: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "id": 2,
        "params": {
            "name": "get_pet",
            "arguments": {"petId": 7}
        }
    }))
    .unwrap();

    let params: CallToolParams = serde_json::from_value(request.params).unwrap();
    assert_eq!(params.name, "get_pet");
    assert_eq!(params.arguments["petId"], 7);
}

/// Test notification (no id)
#[test]
fn test_jsonrpc_notification() {
    let request: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized"
    }))
    .unwrap();

    assert!(request.is_notification());
}

/// Missing params defaults to null rather than failing deserialization
#[test]
fn test_request_without_params() {
    let request: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "method": "ping",
        "id": 3
    }))
    .unwrap();
    assert!(request.params.is_null());
}

// =============================================================================
// Response Shape Tests
// =============================================================================

#[test]
fn test_success_response_omits_error() {
    let response = JsonRpcResponse::success(Some(json!(1)), json!({"tools": []}));
    let wire = serde_json::to_value(&response).unwrap();

    assert_eq!(wire["jsonrpc"], "2.0");
    assert!(wire.get("error").is_none());
    assert!(wire["result"]["tools"].is_array());
}

#[test]
fn test_error_response_carries_kind_record() {
    let err = GatewayError::Transport(TransportError::not_connected("upstream-a"));
    let response = JsonRpcResponse::error_with_data(
        Some(json!(4)),
        err.rpc_code(),
        err.to_string(),
        err.rpc_data(),
    );
    let wire = serde_json::to_value(&response).unwrap();

    assert_eq!(wire["error"]["code"], rpc_code::UPSTREAM_ERROR);
    assert_eq!(wire["error"]["data"]["kind"], "not_connected");
    assert_eq!(wire["error"]["data"]["upstream_name"], "upstream-a");
}

#[test]
fn test_error_code_constants() {
    assert_eq!(rpc_code::METHOD_NOT_FOUND, -32601);
    assert_eq!(rpc_code::NOT_INITIALIZED, -32002);
    assert_eq!(rpc_code::INTERNAL_ERROR, -32603);
    assert_eq!(rpc_code::PARSE_ERROR, -32700);
}

// =============================================================================
// Tool Schema Tests
// =============================================================================

#[test]
fn test_tool_info_wire_shape() {
    let info = ToolInfo {
        name: "exhaustive_search".to_string(),
        description: "Search".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }),
    };
    let wire = serde_json::to_value(&info).unwrap();

    assert!(wire["inputSchema"]["required"]
        .as_array()
        .unwrap()
        .contains(&json!("query")));
}

#[test]
fn test_call_result_content_blocks() {
    let result: CallToolResult = serde_json::from_value(json!({
        "content": [{"type": "text", "text": "answer"}],
        "isError": false
    }))
    .unwrap();
    assert_eq!(result.content.len(), 1);
    assert_eq!(result.content[0].as_text(), "answer");
    assert!(!result.is_error);

    let error_result = CallToolResult {
        content: vec![ToolContent::text("boom")],
        is_error: true,
    };
    let wire = serde_json::to_value(&error_result).unwrap();
    assert_eq!(wire["isError"], true);
}

// =============================================================================
// Stream Chunk Tests
// =============================================================================

#[test]
fn test_stream_chunk_roundtrip() {
    let chunk = StreamChunk::new("partial text", 5, false);
    let wire = serde_json::to_value(&chunk).unwrap();

    assert_eq!(wire["chunkId"], 5);
    assert_eq!(wire["isFinal"], false);
    assert!(wire["timestamp"].as_i64().unwrap() > 0);

    let back: StreamChunk = serde_json::from_value(wire).unwrap();
    assert_eq!(back.content, "partial text");
    assert_eq!(back.chunk_id, 5);
}

#[test]
fn test_stream_chunk_tolerates_missing_timestamp() {
    let chunk: StreamChunk = serde_json::from_value(json!({
        "content": "x",
        "chunkId": 0,
        "isFinal": true
    }))
    .unwrap();
    assert!(chunk.is_final);
    assert_eq!(chunk.timestamp, 0);
}
