//! Fuzzing library for mcp-gateway.
//!
//! This crate provides fuzzing targets for the template expression
//! lexer/parser and the JSON-RPC envelope deserialization.
//!
//! # Usage
//!
//! ```bash
//! cd crates/dsl-fuzz
//! cargo +nightly fuzz run fuzz_dsl_parse -- -max_total_time=60
//! ```

pub use mcp_gateway::dsl;
pub use mcp_gateway::protocol;
