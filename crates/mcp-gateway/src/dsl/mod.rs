//! Template expression engine for HTTP-backed tools.
//!
//! A tool's `path`, `headers.*`, `request_body` and `response_body` fields
//! are strings in a small pure expression language. The gateway supplies an
//! evaluation context of the shape
//! `{args, config, request, response}` (`response` only when rendering
//! `response_body`); evaluation never performs I/O, and an expression that
//! does not reference `response.*` yields the same value for equal inputs on
//! every run.

pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

use std::collections::BTreeMap;

pub use eval::eval;
pub use parser::{Expr, parse};
pub use value::Value;

use crate::error::DslResult;
use crate::protocol::RequestInfo;

/// Parse and evaluate an expression source in one step.
///
/// # Errors
///
/// Returns a [`crate::error::DslError`] on parse or evaluation failure.
pub fn eval_str(src: &str, root: &Value) -> DslResult<Value> {
    let expr = parse(src)?;
    eval(&expr, root)
}

/// Builder for the per-call evaluation context.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    args: Value,
    config: Value,
    request: Value,
    response: Option<Value>,
}

impl EvalContext {
    /// Start from tool-call arguments.
    #[must_use]
    pub fn new(arguments: &serde_json::Value) -> Self {
        Self {
            args: Value::from_json(arguments),
            config: Value::Map(BTreeMap::new()),
            request: Value::Map(BTreeMap::new()),
            response: None,
        }
    }

    /// Attach the tool's static configuration (base URL and friends).
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Attach the frozen session request info.
    #[must_use]
    pub fn with_request(mut self, info: &RequestInfo) -> Self {
        let to_map = |entries: &std::collections::HashMap<String, String>| {
            Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        };
        let mut request = BTreeMap::new();
        request.insert("headers".to_string(), to_map(&info.headers));
        request.insert("queries".to_string(), to_map(&info.queries));
        request.insert("cookies".to_string(), to_map(&info.cookies));
        self.request = Value::Map(request);
        self
    }

    /// Attach the upstream HTTP response (for `response_body` templates).
    #[must_use]
    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    /// Materialize the root value handed to the evaluator.
    #[must_use]
    pub fn into_root(self) -> Value {
        let mut root = BTreeMap::new();
        root.insert("args".to_string(), self.args);
        root.insert("config".to_string(), self.config);
        root.insert("request".to_string(), self.request);
        root.insert("response".to_string(), self.response.unwrap_or(Value::Null));
        Value::Map(root)
    }
}
