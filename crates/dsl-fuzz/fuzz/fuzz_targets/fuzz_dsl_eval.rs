#![no_main]

use libfuzzer_sys::fuzz_target;
use mcp_gateway::dsl::{Value, eval, parse};

fuzz_target!(|data: &[u8]| {
    // Evaluation surfaces every failure as a DslError, never a panic.
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(ast) = parse(text) {
            let root = Value::from_json(&serde_json::json!({
                "args": {"q": "x", "n": 1},
                "config": {"baseUrl": "https://example"},
                "request": {"headers": {}, "queries": {}, "cookies": {}}
            }));
            let _ = eval(&ast, &root);
        }
    }
});
