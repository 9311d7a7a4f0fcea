//! Tenant-scoped configuration model.
//!
//! All models use `#[serde(default)]` for optional fields and rename rules
//! matching the management API JSON. An [`McpConfig`] is the unit of
//! activation: it carries the upstream servers, the routers that expose them,
//! and the HTTP-backed tools synthesized from OpenAPI imports.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Transport flavor of an upstream MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Long-lived SSE connection to a remote MCP server.
    #[default]
    Sse,
    /// Child process speaking JSON-RPC over stdin/stdout.
    Stdio,
}

/// When the upstream connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectPolicy {
    /// Connect during config activation; activation fails if connect fails.
    #[default]
    OnStart,
    /// Connect lazily on first use; one reconnect attempt per request.
    OnDemand,
}

/// One upstream MCP server inside a config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    /// Unique within the config.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub server_type: ServerType,
    /// Binary to spawn (STDIO only).
    #[serde(default)]
    pub command: String,
    /// Arguments for the spawned binary (STDIO only).
    #[serde(default)]
    pub args: Vec<String>,
    /// SSE endpoint URL (SSE only).
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub policy: ConnectPolicy,
    /// If true, skip the install probe for the command binary.
    #[serde(default)]
    pub preinstalled: bool,
    /// If true, tool calls are surfaced as chunk streams.
    #[serde(default)]
    pub streamable: bool,
}

/// Cross-origin policy attached to a router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsPolicy {
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
}

impl CorsPolicy {
    /// True when the policy allows the given origin.
    #[must_use]
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allow_origins.iter().any(|o| o == "*" || o == origin)
    }
}

/// Maps a URL prefix to one server (or HTTP server) of the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    /// URL segment exposed to clients; unique per gateway replica.
    pub prefix: String,
    /// Name of the [`McpServer`] or [`HttpServer`] this router fronts.
    pub server: String,
    /// Optional alternate prefix for the SSE endpoint.
    #[serde(default)]
    pub sse_prefix: Option<String>,
    #[serde(default)]
    pub cors: Option<CorsPolicy>,
}

impl Router {
    /// The prefix the SSE endpoint answers on.
    #[must_use]
    pub fn sse_prefix(&self) -> &str {
        self.sse_prefix.as_deref().unwrap_or(&self.prefix)
    }
}

/// Where a tool argument is injected into the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgPosition {
    Path,
    Query,
    Header,
    Body,
}

/// One argument descriptor of an HTTP-backed tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolArg {
    pub name: String,
    pub position: ArgPosition,
    #[serde(rename = "type", default)]
    pub arg_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// An HTTP-backed tool, synthesized from OpenAPI or authored directly.
///
/// `path`, `headers.*`, `request_body` and `response_body` are DSL template
/// strings evaluated per call against `{args, config, request, response}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// HTTP verb.
    pub method: String,
    /// Absolute URL or path relative to the parent http server's base URL.
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub args: Vec<ToolArg>,
    /// JSON-Schema fragment advertised in `tools/list`.
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub response_body: String,
}

/// Groups [`Tool`]s under a shared base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServer {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// Names of the tools served from this base URL.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Unit of tenant-scoped configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    pub name: String,
    pub tenant_name: String,
    #[serde(default)]
    pub servers: Vec<McpServer>,
    #[serde(default)]
    pub routers: Vec<Router>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub http_servers: Vec<HttpServer>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl McpConfig {
    /// Composite identity, unique per tenant.
    #[must_use]
    pub fn identity(&self) -> (String, String) {
        (self.tenant_name.clone(), self.name.clone())
    }

    /// True once the config has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Look up an upstream server by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&McpServer> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Look up an HTTP server by name.
    #[must_use]
    pub fn http_server(&self, name: &str) -> Option<&HttpServer> {
        self.http_servers.iter().find(|s| s.name == name)
    }

    /// Look up a tool descriptor by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Find the router matching a request prefix (SSE prefixes included).
    #[must_use]
    pub fn router_for_prefix(&self, prefix: &str) -> Option<&Router> {
        self.routers.iter().find(|r| r.prefix == prefix || r.sse_prefix() == prefix)
    }

    /// Validate the config for activation.
    ///
    /// Checks the invariants that must hold before a [`TransportManager`]
    /// is built: at least one router, unique prefixes within the config,
    /// and every router referencing a known server or HTTP server.
    ///
    /// [`TransportManager`]: crate::upstream::TransportManager
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routers.is_empty() {
            return Err(ConfigError::EmptyConfig { name: self.name.clone() });
        }

        let mut prefixes = HashSet::new();
        for router in &self.routers {
            if !prefixes.insert(router.prefix.as_str()) {
                return Err(ConfigError::DuplicatePrefix { prefix: router.prefix.clone() });
            }

            let known = self.server(&router.server).is_some()
                || self.http_server(&router.server).is_some();
            if !known {
                return Err(ConfigError::DanglingServer {
                    router: router.prefix.clone(),
                    server: router.server.clone(),
                });
            }
        }

        Ok(())
    }

    /// Server names in collision-resolution order: `servers` first, then
    /// `http_servers`. The first server contributing a tool name wins;
    /// duplicates are dropped with a warning at discovery time.
    #[must_use]
    pub fn server_order(&self) -> Vec<&str> {
        self.servers
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.http_servers.iter().map(|s| s.name.as_str()))
            .collect()
    }
}
