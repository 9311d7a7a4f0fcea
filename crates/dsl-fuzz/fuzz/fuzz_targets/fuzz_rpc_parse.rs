#![no_main]

use libfuzzer_sys::fuzz_target;
use mcp_gateway::protocol::{JsonRpcRequest, JsonRpcResponse};

fuzz_target!(|data: &[u8]| {
    // Try to parse arbitrary bytes as JSON-RPC envelopes
    let _ = serde_json::from_slice::<JsonRpcRequest>(data);
    let _ = serde_json::from_slice::<JsonRpcResponse>(data);
});
