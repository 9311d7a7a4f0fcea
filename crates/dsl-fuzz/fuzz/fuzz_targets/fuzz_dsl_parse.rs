#![no_main]

use libfuzzer_sys::fuzz_target;
use mcp_gateway::dsl::parse;

fuzz_target!(|data: &[u8]| {
    // The parser must reject or accept arbitrary input without panicking,
    // and anything it accepts must print to a form it accepts again.
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(ast) = parse(text) {
            let printed = ast.to_string();
            let reparsed = parse(&printed).expect("printed form must re-parse");
            assert_eq!(ast, reparsed);
        }
    }
});
