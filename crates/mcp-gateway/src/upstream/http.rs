//! HTTP-tool transport: serves the tools grouped under one `HttpServer`.
//!
//! There is no upstream connection. Each call evaluates the tool's `path`,
//! `headers.*` and `request_body` templates against
//! `{args, config, request}`, performs the HTTP request, then evaluates
//! `response_body` against the same context plus `response`. Any template
//! failure before the request aborts the call without sending it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::dsl::{self, EvalContext, Value};
use crate::error::{TransportError, TransportResult};
use crate::model::{ArgPosition, HttpServer, Tool};
use crate::protocol::{CallToolParams, CallToolResult, RequestInfo, ToolInfo};
use crate::upstream::{Transport, TransportStatus};

/// Transport for one HTTP server group.
pub struct HttpToolTransport {
    name: String,
    base_url: String,
    tools: Vec<Tool>,
    http: reqwest::Client,
    call_timeout: Duration,
}

impl HttpToolTransport {
    /// Build the transport from an `HttpServer` and its resolved tools.
    ///
    /// # Errors
    ///
    /// Returns a connect error when the HTTP client cannot be constructed.
    pub fn new(
        server: &HttpServer,
        tools: Vec<Tool>,
        call_timeout: Duration,
    ) -> TransportResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::connect(format!("build http client: {e}")))?;

        Ok(Self {
            name: server.name.clone(),
            base_url: server.url.trim_end_matches('/').to_string(),
            tools,
            http,
            call_timeout,
        })
    }

    fn tool(&self, name: &str) -> TransportResult<&Tool> {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| TransportError::tool_not_found(name))
    }

    fn config_value(&self) -> Value {
        let mut config = BTreeMap::new();
        config.insert("baseUrl".to_string(), Value::String(self.base_url.clone()));
        config.insert("server".to_string(), Value::String(self.name.clone()));
        Value::Map(config)
    }

    /// Resolve the evaluated path against the base URL.
    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn execute(
        &self,
        tool: &Tool,
        params: &CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult> {
        let root = EvalContext::new(&params.arguments)
            .with_config(self.config_value())
            .with_request(request_info)
            .into_root();

        // URL, headers and body all evaluate before any I/O; a template
        // failure here means the request is never sent.
        let path = render(&tool.path, &root)?;
        let url = self.resolve_url(&path);

        let mut headers = Vec::new();
        for (header_name, template) in &tool.headers {
            headers.push((header_name.clone(), render(template, &root)?));
        }

        let body = if tool.request_body.is_empty() {
            body_from_args(tool, &params.arguments)
        } else {
            Some(render(&tool.request_body, &root)?)
        };

        let method = reqwest::Method::from_bytes(tool.method.to_uppercase().as_bytes())
            .map_err(|_| TransportError::protocol(format!("invalid method '{}'", tool.method)))?;

        let mut request = self.http.request(method, &url).timeout(self.call_timeout);
        for (header_name, header_value) in headers {
            request = request.header(header_name, header_value);
        }
        for (query_name, query_value) in query_args(tool, &params.arguments) {
            request = request.query(&[(query_name, query_value)]);
        }
        for (header_name, header_value) in header_args(tool, &params.arguments) {
            request = request.header(header_name, header_value);
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        tracing::debug!(tool = %tool.name, url = %url, "dispatching http tool call");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.call_timeout)
            } else {
                TransportError::upstream(-1, format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        let response_headers: BTreeMap<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str().ok().map(|v| (k.to_string(), Value::String(v.to_string())))
            })
            .collect();
        let body_text = response
            .text()
            .await
            .map_err(|e| TransportError::upstream(i32::from(status.as_u16()), e.to_string()))?;

        if status.is_client_error() || status.is_server_error() {
            return Err(TransportError::upstream(i32::from(status.as_u16()), body_text));
        }

        if tool.response_body.is_empty() {
            return Ok(CallToolResult::text(body_text));
        }

        let body_value = serde_json::from_str::<serde_json::Value>(&body_text)
            .map_or_else(|_| Value::String(body_text.clone()), |json| Value::from_json(&json));
        let mut response_map = BTreeMap::new();
        response_map.insert("status", Value::Number(f64::from(status.as_u16())));
        response_map.insert("headers", Value::Map(response_headers));
        response_map.insert("body", body_value);
        let response_value = Value::Map(
            response_map.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        );

        let root = EvalContext::new(&params.arguments)
            .with_config(self.config_value())
            .with_request(request_info)
            .with_response(response_value)
            .into_root();
        let rendered = render(&tool.response_body, &root)?;

        Ok(CallToolResult::text(rendered))
    }
}

#[async_trait]
impl Transport for HttpToolTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> TransportStatus {
        // Connectionless: always ready.
        TransportStatus::Ready
    }

    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn fetch_tools(&self) -> TransportResult<Vec<ToolInfo>> {
        Ok(self
            .tools
            .iter()
            .map(|tool| ToolInfo {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: if tool.input_schema.is_null() {
                    serde_json::json!({"type": "object"})
                } else {
                    tool.input_schema.clone()
                },
            })
            .collect())
    }

    async fn call_tools(
        &self,
        params: CallToolParams,
        request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult> {
        let tool = self.tool(&params.name)?;
        self.execute(tool, &params, request_info).await
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Evaluate a template to its rendered string form.
fn render(template: &str, root: &Value) -> TransportResult<String> {
    let value = dsl::eval_str(template, root)?;
    Ok(value.render())
}

fn query_args(tool: &Tool, arguments: &serde_json::Value) -> Vec<(String, String)> {
    args_at(tool, arguments, ArgPosition::Query)
}

fn header_args(tool: &Tool, arguments: &serde_json::Value) -> Vec<(String, String)> {
    args_at(tool, arguments, ArgPosition::Header)
}

fn args_at(
    tool: &Tool,
    arguments: &serde_json::Value,
    position: ArgPosition,
) -> Vec<(String, String)> {
    tool.args
        .iter()
        .filter(|arg| arg.position == position)
        .filter_map(|arg| {
            arguments
                .get(&arg.name)
                .map(|value| (arg.name.clone(), Value::from_json(value).render()))
        })
        .collect()
}

/// When no `request_body` template is authored, body-position arguments are
/// sent as a JSON object.
fn body_from_args(tool: &Tool, arguments: &serde_json::Value) -> Option<String> {
    let body: serde_json::Map<String, serde_json::Value> = tool
        .args
        .iter()
        .filter(|arg| arg.position == ArgPosition::Body)
        .filter_map(|arg| arguments.get(&arg.name).map(|v| (arg.name.clone(), v.clone())))
        .collect();
    if body.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(body).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolArg;

    fn server() -> HttpServer {
        HttpServer {
            name: "petstore".to_string(),
            description: String::new(),
            url: "https://petstore.example/".to_string(),
            tools: vec!["get_pet".to_string()],
        }
    }

    fn tool() -> Tool {
        Tool {
            name: "get_pet".to_string(),
            description: "Fetch one pet".to_string(),
            method: "GET".to_string(),
            path: "\"/pets/\" + toString(args.petId)".to_string(),
            headers: std::collections::HashMap::new(),
            args: vec![ToolArg {
                name: "petId".to_string(),
                position: ArgPosition::Path,
                arg_type: "integer".to_string(),
                required: true,
                description: String::new(),
            }],
            input_schema: serde_json::json!({"type": "object"}),
            request_body: String::new(),
            response_body: String::new(),
        }
    }

    #[tokio::test]
    async fn test_transport_is_always_ready() {
        let transport = HttpToolTransport::new(&server(), vec![tool()], Duration::from_secs(2)).unwrap();
        assert_eq!(transport.status().await, TransportStatus::Ready);
        transport.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_tools_exposes_schema() {
        let transport = HttpToolTransport::new(&server(), vec![tool()], Duration::from_secs(2)).unwrap();
        let tools = transport.fetch_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_pet");
        assert_eq!(tools[0].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let transport = HttpToolTransport::new(&server(), vec![tool()], Duration::from_secs(2)).unwrap();
        let err = transport
            .call_tools(
                CallToolParams { name: "nope".to_string(), arguments: serde_json::json!({}) },
                &RequestInfo::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_template_failure_aborts_before_sending() {
        let mut bad_tool = tool();
        bad_tool.path = "1/0".to_string();
        let transport =
            HttpToolTransport::new(&server(), vec![bad_tool], Duration::from_secs(2)).unwrap();

        let err = transport
            .call_tools(
                CallToolParams { name: "get_pet".to_string(), arguments: serde_json::json!({}) },
                &RequestInfo::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Template(_)));
        assert_eq!(err.kind(), "dsl_error");
    }

    #[test]
    fn test_resolve_url() {
        let transport = HttpToolTransport::new(&server(), vec![], Duration::from_secs(2)).unwrap();
        assert_eq!(transport.resolve_url("/pets/1"), "https://petstore.example/pets/1");
        assert_eq!(transport.resolve_url("pets/1"), "https://petstore.example/pets/1");
        assert_eq!(transport.resolve_url("https://other.example/x"), "https://other.example/x");
    }

    #[test]
    fn test_body_from_args() {
        let mut t = tool();
        t.args.push(ToolArg {
            name: "note".to_string(),
            position: ArgPosition::Body,
            arg_type: "string".to_string(),
            required: false,
            description: String::new(),
        });
        let body = body_from_args(&t, &serde_json::json!({"note": "hi", "petId": 2})).unwrap();
        assert_eq!(body, "{\"note\":\"hi\"}");

        assert!(body_from_args(&t, &serde_json::json!({"petId": 2})).is_none());
    }
}
