//! Error types for the MCP gateway.
//!
//! Uses `thiserror` for structured error handling with automatic `From`
//! implementations. Every upstream failure is translated into one of these
//! families before it crosses a module boundary; handlers map them onto
//! JSON-RPC error objects or HTTP status codes.

use std::time::Duration;

/// JSON-RPC error codes used by the gateway.
pub mod rpc_code {
    /// Malformed JSON in the request body.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method is not part of the MCP surface.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Missing or malformed parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Unexpected internal failure.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// `tools/*` issued before a successful `initialize`.
    pub const NOT_INITIALIZED: i32 = -32002;
    /// Upstream transport or tool failure.
    pub const UPSTREAM_ERROR: i32 = -32000;
}

/// Errors from upstream MCP transports (SSE, STDIO, streamable, HTTP tools).
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The transport has no live connection.
    #[error("transport '{name}' is not connected")]
    NotConnected {
        /// Upstream server name.
        name: String,
    },

    /// The requested tool is not served by this transport.
    #[error("tool not found: {name}")]
    ToolNotFound {
        /// Tool name as requested by the client.
        name: String,
    },

    /// The upstream returned a JSON-RPC error response.
    #[error("upstream error ({code}): {message}")]
    Upstream {
        /// JSON-RPC error code from the upstream.
        code: i32,
        /// Upstream error message.
        message: String,
    },

    /// The upstream did not answer within the call timeout.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled (client disconnect or transport stop).
    #[error("call cancelled")]
    Cancelled,

    /// Establishing the connection failed.
    #[error("connect failed: {message}")]
    Connect {
        /// Handshake or socket-level failure description.
        message: String,
    },

    /// The STDIO command binary could not be provisioned.
    ///
    /// Reported distinctly from [`TransportError::Connect`] so callers can
    /// tell a missing binary apart from a handshake failure.
    #[error("install failed: {message}")]
    Install {
        /// What the install probe could not resolve.
        message: String,
    },

    /// The upstream sent a frame the gateway could not interpret.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the malformed frame.
        message: String,
    },

    /// A URL/header/body template failed to evaluate; the HTTP request was
    /// not sent.
    #[error("template error: {0}")]
    Template(#[from] DslError),
}

impl TransportError {
    /// Create a not-connected error.
    #[must_use]
    pub fn not_connected(name: impl Into<String>) -> Self {
        Self::NotConnected { name: name.into() }
    }

    /// Create a tool-not-found error.
    #[must_use]
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    /// Create an upstream error from a JSON-RPC error object.
    #[must_use]
    pub fn upstream(code: i32, message: impl Into<String>) -> Self {
        Self::Upstream { code, message: message.into() }
    }

    /// Create a connect error.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect { message: message.into() }
    }

    /// Create an install error.
    #[must_use]
    pub fn install(message: impl Into<String>) -> Self {
        Self::Install { message: message.into() }
    }

    /// Create a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Returns true if a single reconnect attempt is worth making.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Timeout(_))
    }

    /// Short machine-readable kind tag for the JSON-RPC `data` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "not_connected",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::Upstream { .. } => "upstream_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Connect { .. } => "connect_failed",
            Self::Install { .. } => "install_failed",
            Self::Protocol { .. } => "protocol_error",
            Self::Template(_) => "dsl_error",
        }
    }
}

/// Errors from the session store (memory or Redis).
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The backing store is unreachable; surfaced as 503 to clients.
    #[error("session store unavailable: {message}")]
    Unavailable {
        /// Underlying failure description.
        message: String,
    },

    /// No live session with this id.
    #[error("session not found: {id}")]
    SessionNotFound {
        /// The session id that missed.
        id: String,
    },

    /// The session's channel has been closed.
    #[error("session closed")]
    Closed,

    /// A stored payload failed to (de)serialize.
    #[error("store payload error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Create an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Create a session-not-found error.
    #[must_use]
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    /// Returns true if the operation may succeed on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable { message: err.to_string() }
    }
}

/// Activation-time validation failures for an [`McpConfig`].
///
/// [`McpConfig`]: crate::model::McpConfig
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Two live routers claim the same URL prefix.
    #[error("prefix '{prefix}' is already in use")]
    DuplicatePrefix {
        /// The contested prefix.
        prefix: String,
    },

    /// A router references a server name that does not exist in the config.
    #[error("router '{router}' references unknown server '{server}'")]
    DanglingServer {
        /// Router prefix.
        router: String,
        /// The missing server name.
        server: String,
    },

    /// The config has no routers to expose.
    #[error("config '{name}' has no routers")]
    EmptyConfig {
        /// Config name.
        name: String,
    },

    /// A CORS policy field could not be interpreted.
    #[error("invalid CORS policy: {message}")]
    InvalidCors {
        /// What was wrong with the policy.
        message: String,
    },
}

/// Errors from DSL template parsing or evaluation.
///
/// All variants are surfaced to the client as a `dsl_error` on the
/// `tools/call`; the HTTP request is never sent once one occurs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DslError {
    /// Lexing or parsing failure.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Human-readable description.
        message: String,
        /// Byte offset into the expression source.
        offset: usize,
    },

    /// An operator or function received a value of the wrong type.
    #[error("type error: expected {expected}, found {found}")]
    Type {
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        found: &'static str,
    },

    /// Numeric division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Call to a function that is not a built-in.
    #[error("unknown function: {name}")]
    UnknownFunction {
        /// The unresolved function name.
        name: String,
    },

    /// A root identifier that is not bound in the evaluation context.
    ///
    /// Only top-level names are checked; member access on a bound value
    /// degrades to `null` instead.
    #[error("unknown identifier: {name}")]
    UnknownIdentifier {
        /// The unresolved identifier.
        name: String,
    },

    /// A built-in was called with the wrong number of arguments.
    #[error("{name} expects {expected} argument(s), got {found}")]
    Arity {
        /// Function name.
        name: &'static str,
        /// Expected arity description (e.g. "1" or "2..3").
        expected: &'static str,
        /// Number of arguments supplied.
        found: usize,
    },
}

impl DslError {
    /// Create a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>, offset: usize) -> Self {
        Self::Parse { message: message.into(), offset }
    }

    /// Create a type error.
    #[must_use]
    pub const fn type_error(expected: &'static str, found: &'static str) -> Self {
        Self::Type { expected, found }
    }
}

/// Umbrella error for the client-facing gateway layer.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// No active router for this prefix.
    #[error("unknown prefix: {prefix}")]
    UnknownPrefix {
        /// The prefix from the request path.
        prefix: String,
    },

    /// The session id does not resolve, or belongs to another prefix.
    #[error("session not found: {id}")]
    SessionNotFound {
        /// Session id from the query or header.
        id: String,
    },

    /// `tools/*` issued before `initialize`.
    #[error("session not initialized")]
    NotInitialized,

    /// Unknown JSON-RPC method.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// The unrecognized method name.
        method: String,
    },

    /// Missing or malformed JSON-RPC parameters.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Description of the parameter problem.
        message: String,
    },

    /// Session store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Upstream transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Template evaluation failure.
    #[error("dsl error: {0}")]
    Dsl(#[from] DslError),

    /// Unexpected internal failure, logged with context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create an invalid-params error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams { message: message.into() }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The JSON-RPC error code for this failure.
    #[must_use]
    pub const fn rpc_code(&self) -> i32 {
        match self {
            Self::MethodNotFound { .. } => rpc_code::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => rpc_code::INVALID_PARAMS,
            Self::NotInitialized => rpc_code::NOT_INITIALIZED,
            Self::Transport(_) | Self::Dsl(_) => rpc_code::UPSTREAM_ERROR,
            Self::UnknownPrefix { .. }
            | Self::SessionNotFound { .. }
            | Self::Store(_)
            | Self::Internal(_) => rpc_code::INTERNAL_ERROR,
        }
    }

    /// Best-effort machine-readable record for the JSON-RPC `data` field.
    #[must_use]
    pub fn rpc_data(&self) -> serde_json::Value {
        let kind = match self {
            Self::UnknownPrefix { .. } => "invalid_prefix",
            Self::SessionNotFound { .. } => "bad_session",
            Self::NotInitialized => "not_initialized",
            Self::MethodNotFound { .. } => "unknown_method",
            Self::InvalidParams { .. } => "malformed_arguments",
            Self::Store(_) => "store_unavailable",
            Self::Transport(e) => e.kind(),
            Self::Dsl(_) => "dsl_error",
            Self::Internal(_) => "internal",
        };
        if let Self::Transport(TransportError::NotConnected { name }) = self {
            return serde_json::json!({ "kind": kind, "upstream_name": name });
        }
        serde_json::json!({ "kind": kind })
    }
}

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for DSL evaluation.
pub type DslResult<T> = Result<T, DslError>;

/// Result type alias for gateway-layer operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
