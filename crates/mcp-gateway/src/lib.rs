//! MCP Gateway
//!
//! A multi-tenant gateway for the Model Context Protocol: accepts client
//! MCP sessions over SSE and streamable HTTP at config-driven URL prefixes,
//! and multiplexes each session's `tools/list` and `tools/call` requests
//! onto a pool of upstream MCP servers (SSE, STDIO, or HTTP-backed tools
//! synthesized from OpenAPI documents).
//!
//! # Architecture
//!
//! - **Session store**: pluggable memory / Redis storage with cross-replica
//!   pub/sub fan-out, so a POST handled by one replica reaches an SSE
//!   stream held open on another.
//! - **Upstream transports**: one adapter per upstream server with a
//!   connect-policy state machine, tool discovery, and chunked streaming.
//! - **Runtime snapshot**: wait-free `prefix → (config, manager)` reads;
//!   activations swap an immutable snapshot and drain displaced managers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_gateway::config::Settings;
//! use mcp_gateway::runtime::GatewayRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env()?;
//!     let runtime = Arc::new(GatewayRuntime::new(settings.call_timeout));
//!
//!     // Activate configs through the runtime, then serve.
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod dsl;
pub mod error;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod store;
pub mod upstream;

pub use config::Settings;
pub use error::{ConfigError, DslError, GatewayError, StoreError, TransportError};
pub use model::McpConfig;
pub use runtime::GatewayRuntime;
pub use upstream::TransportManager;
