//! End-to-end gateway tests over real sockets.
//!
//! A fake upstream MCP server (axum, SSE + message endpoint) stands in for
//! remote tool providers; wiremock covers plain HTTP tools. The gateway app
//! is served on an ephemeral port and exercised with reqwest.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use tokio::sync::{Mutex, mpsc};

use mcp_gateway::config::Settings;
use mcp_gateway::model::{
    ConnectPolicy, HttpServer, McpConfig, McpServer, Router, ServerType, Tool,
};
use mcp_gateway::notify::{ConfigEvent, ConfigOp, Notifier, SignalNotifier};
use mcp_gateway::runtime::GatewayRuntime;
use mcp_gateway::server::{AppState, build_router};
use mcp_gateway::store::SessionStore;
use mcp_gateway::store::memory::MemoryStore;
use mcp_gateway::upstream::sse::{SseFrame, parse_sse_stream};
use wiremock::matchers::{method as wm_method, path as wm_path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Fake upstream MCP server (SSE + message endpoint)
// =============================================================================

#[derive(Clone)]
struct UpstreamState {
    sender: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    chunked: bool,
}

async fn upstream_sse(State(state): State<UpstreamState>) -> impl IntoResponse {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    *state.sender.lock().await = Some(tx);

    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(Event::default().event("endpoint").data("/message"));
        while let Some(payload) = rx.recv().await {
            yield Ok(Event::default().event("message").data(payload));
        }
    };
    Sse::new(stream)
}

async fn upstream_message(
    State(state): State<UpstreamState>,
    Json(request): Json<serde_json::Value>,
) -> StatusCode {
    let Some(tx) = state.sender.lock().await.clone() else {
        return StatusCode::BAD_REQUEST;
    };
    let id = request["id"].clone();
    let send = |payload: serde_json::Value| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(payload.to_string()).await;
        }
    };

    match request["method"].as_str().unwrap_or_default() {
        "initialize" => {
            send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-upstream", "version": "0.0.0"}
                }
            }))
            .await;
        }
        "tools/list" => {
            send(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": [{
                        "name": "streamer",
                        "description": "Streams three parts",
                        "inputSchema": {"type": "object"}
                    }]
                }
            }))
            .await;
        }
        "tools/call" => {
            if state.chunked {
                for (i, part) in ["part0", "part1", "part2"].iter().enumerate() {
                    send(serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id.clone(),
                        "result": {
                            "content": part,
                            "chunkId": i,
                            "isFinal": i == 2
                        }
                    }))
                    .await;
                }
            } else {
                send(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [{"type": "text", "text": "single"}]}
                }))
                .await;
            }
        }
        _ => {}
    }
    StatusCode::ACCEPTED
}

async fn start_fake_upstream(chunked: bool) -> String {
    let state = UpstreamState { sender: Arc::new(Mutex::new(None)), chunked };
    let app = axum::Router::new()
        .route("/sse", get(upstream_sse))
        .route("/message", post(upstream_message))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// =============================================================================
// Gateway harness
// =============================================================================

async fn start_gateway(config: McpConfig) -> (String, Arc<AppState>) {
    let settings = Settings::for_testing();
    let runtime = Arc::new(GatewayRuntime::new(settings.call_timeout));
    runtime.activate(config).await.unwrap();

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new(settings.channel_capacity));
    let notifier: Arc<dyn Notifier> = Arc::new(SignalNotifier::new());
    let state = AppState::new(settings, runtime, store, notifier, None);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn sse_upstream_config(upstream_base: &str, streamable: bool) -> McpConfig {
    McpConfig {
        name: "cfg".to_string(),
        tenant_name: "t".to_string(),
        servers: vec![McpServer {
            name: "up".to_string(),
            description: String::new(),
            server_type: ServerType::Sse,
            command: String::new(),
            args: vec![],
            url: format!("{upstream_base}/sse"),
            policy: ConnectPolicy::OnStart,
            preinstalled: false,
            streamable,
        }],
        routers: vec![Router {
            prefix: "t1".to_string(),
            server: "up".to_string(),
            sse_prefix: None,
            cors: None,
        }],
        tools: vec![],
        http_servers: vec![],
        created_at: None,
        updated_at: None,
        deleted_at: None,
    }
}

fn http_tool_config(upstream_base: &str) -> McpConfig {
    McpConfig {
        name: "cfg".to_string(),
        tenant_name: "t".to_string(),
        servers: vec![],
        routers: vec![Router {
            prefix: "t1".to_string(),
            server: "svc".to_string(),
            sse_prefix: None,
            cors: Some(mcp_gateway::model::CorsPolicy {
                allow_origins: vec!["*".to_string()],
                allow_credentials: false,
                allow_methods: vec!["GET".to_string(), "POST".to_string()],
                allow_headers: vec!["Content-Type".to_string()],
                expose_headers: vec![],
            }),
        }],
        tools: vec![Tool {
            name: "echo".to_string(),
            description: "Echo".to_string(),
            method: "GET".to_string(),
            path: "\"/echo\"".to_string(),
            headers: HashMap::new(),
            args: vec![],
            input_schema: serde_json::json!({"type": "object"}),
            request_body: String::new(),
            response_body: String::new(),
        }],
        http_servers: vec![HttpServer {
            name: "svc".to_string(),
            description: String::new(),
            url: upstream_base.to_string(),
            tools: vec!["echo".to_string()],
        }],
        created_at: None,
        updated_at: None,
        deleted_at: None,
    }
}

async fn open_sse(client: &reqwest::Client, url: &str) -> mpsc::Receiver<SseFrame> {
    let response = client.get(url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"), "got {content_type}");

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(parse_sse_stream(response.bytes_stream(), tx));
    rx
}

async fn next_frame(frames: &mut mpsc::Receiver<SseFrame>) -> SseFrame {
    tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for SSE frame")
        .expect("SSE stream ended unexpectedly")
}

fn rpc(id: i64, method: &str, params: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

// =============================================================================
// Scenario: SSE handshake (endpoint event, initialize, tools/list)
// =============================================================================

#[tokio::test]
async fn test_sse_handshake_and_tools_list() {
    let upstream = MockServer::start().await;
    Mock::given(wm_method("GET"))
        .and(wm_path("/echo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&upstream)
        .await;

    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let mut frames = open_sse(&client, &format!("{base}/t1/sse")).await;

    // First event names the message endpoint.
    let endpoint = next_frame(&mut frames).await;
    assert_eq!(endpoint.event, "endpoint");
    assert!(endpoint.data.starts_with("/t1/message?session_id="));
    let message_url = format!("{base}{}", endpoint.data);

    // initialize
    let status = client
        .post(&message_url)
        .json(&rpc(1, "initialize", serde_json::json!({})))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 202);

    let frame = next_frame(&mut frames).await;
    assert_eq!(frame.event, "message");
    let response: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(response["id"], 1);
    assert!(response["result"]["capabilities"]["tools"].is_object());

    // tools/list
    client
        .post(&message_url)
        .json(&rpc(2, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();

    let frame = next_frame(&mut frames).await;
    let response: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(response["id"], 2);
    assert_eq!(response["result"]["tools"][0]["name"], "echo");

    // tools/call through the HTTP tool
    client
        .post(&message_url)
        .json(&rpc(3, "tools/call", serde_json::json!({"name": "echo", "arguments": {}})))
        .send()
        .await
        .unwrap();

    let frame = next_frame(&mut frames).await;
    let response: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(response["id"], 3);
    assert_eq!(response["result"]["content"][0]["text"], "hello");
}

// =============================================================================
// Gating and error paths
// =============================================================================

#[tokio::test]
async fn test_tools_before_initialize_rejected_without_touching_upstream() {
    let upstream = MockServer::start().await;
    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let mut frames = open_sse(&client, &format!("{base}/t1/sse")).await;
    let endpoint = next_frame(&mut frames).await;
    let message_url = format!("{base}{}", endpoint.data);

    client
        .post(&message_url)
        .json(&rpc(1, "tools/call", serde_json::json!({"name": "echo", "arguments": {}})))
        .send()
        .await
        .unwrap();

    let frame = next_frame(&mut frames).await;
    let response: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(response["error"]["code"], -32002);

    let requests = upstream.received_requests().await.unwrap();
    assert!(requests.is_empty(), "gated call must not reach upstreams");
}

#[tokio::test]
async fn test_unknown_method_returns_method_not_found() {
    let upstream = MockServer::start().await;
    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let mut frames = open_sse(&client, &format!("{base}/t1/sse")).await;
    let endpoint = next_frame(&mut frames).await;
    let message_url = format!("{base}{}", endpoint.data);

    client
        .post(&message_url)
        .json(&rpc(1, "resources/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();

    let frame = next_frame(&mut frames).await;
    let response: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn test_unknown_prefix_and_session_are_404() {
    let upstream = MockServer::start().await;
    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/nope/sse")).send().await.unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{base}/t1/message?session_id=ghost"))
        .json(&rpc(1, "ping", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{base}/t1/message"))
        .json(&rpc(1, "ping", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_cors_headers_applied_per_router() {
    let upstream = MockServer::start().await;
    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/t1/sse"))
        .header("Origin", "https://app.example")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["access-control-allow-origin"].to_str().unwrap(),
        "*"
    );

    let response = client
        .request(reqwest::Method::OPTIONS, format!("{base}/t1/message"))
        .header("Origin", "https://app.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(response.headers().contains_key("access-control-allow-methods"));
}

// =============================================================================
// Scenario: streaming call over an SSE upstream
// =============================================================================

#[tokio::test]
async fn test_streaming_call_chunks_in_order() {
    let upstream_base = start_fake_upstream(true).await;
    let (base, _state) = start_gateway(sse_upstream_config(&upstream_base, true)).await;
    let client = reqwest::Client::new();

    let mut frames = open_sse(&client, &format!("{base}/t1/sse")).await;
    let endpoint = next_frame(&mut frames).await;
    let message_url = format!("{base}{}", endpoint.data);

    client
        .post(&message_url)
        .json(&rpc(1, "initialize", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    next_frame(&mut frames).await;

    client
        .post(&message_url)
        .json(&rpc(7, "tools/call", serde_json::json!({"name": "streamer", "arguments": {}})))
        .send()
        .await
        .unwrap();

    let mut chunk_ids = Vec::new();
    let mut last_final = false;
    let mut final_content = String::new();
    while !last_final {
        let frame = next_frame(&mut frames).await;
        let response: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(response["id"], 7);
        let result = &response["result"];
        chunk_ids.push(result["chunkId"].as_u64().unwrap());
        last_final = result["isFinal"].as_bool().unwrap();
        if last_final {
            final_content = result["content"].as_str().unwrap().to_string();
        }
    }

    assert!(
        chunk_ids.windows(2).all(|w| w[0] < w[1]),
        "chunk ids must be strictly increasing: {chunk_ids:?}"
    );
    assert_eq!(final_content, "part0part1part2");

    // Nothing further arrives for that request id.
    let extra = tokio::time::timeout(Duration::from_millis(300), frames.recv()).await;
    assert!(extra.is_err(), "no events may follow the final chunk");
}

// =============================================================================
// Streamable HTTP endpoint
// =============================================================================

#[tokio::test]
async fn test_streamable_endpoint_requires_initialize() {
    let upstream = MockServer::start().await;
    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    // Fresh client, no session header: -32002.
    let response = client
        .post(format!("{base}/t1/mcp"))
        .json(&rpc(1, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32002);

    // initialize issues a session id.
    let response = client
        .post(format!("{base}/t1/mcp"))
        .json(&rpc(2, "initialize", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    let session_id = response.headers()["mcp-session-id"].to_str().unwrap().to_string();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["serverInfo"]["name"], "mcp-gateway");

    // With the header, tools/list answers application/json.
    let response = client
        .post(format!("{base}/t1/mcp"))
        .header("Mcp-Session-Id", &session_id)
        .json(&rpc(3, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/json"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["tools"][0]["name"], "echo");
}

#[tokio::test]
async fn test_streamable_endpoint_ndjson_for_streaming_tool() {
    let upstream_base = start_fake_upstream(true).await;
    let (base, _state) = start_gateway(sse_upstream_config(&upstream_base, true)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/t1/mcp"))
        .json(&rpc(1, "initialize", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    let session_id = response.headers()["mcp-session-id"].to_str().unwrap().to_string();

    let response = client
        .post(format!("{base}/t1/mcp"))
        .header("Mcp-Session-Id", &session_id)
        .json(&rpc(2, "tools/call", serde_json::json!({"name": "streamer", "arguments": {}})))
        .send()
        .await
        .unwrap();
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/x-ndjson"), "got {content_type}");

    let body = response.text().await.unwrap();
    let lines: Vec<serde_json::Value> = body
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2]["result"]["isFinal"], true);
    assert_eq!(lines[2]["result"]["content"], "part0part1part2");
}

// =============================================================================
// Lifecycle: idle timeout and reload sink
// =============================================================================

#[tokio::test]
async fn test_idle_session_closed_with_close_event() {
    let upstream = MockServer::start().await;
    let (base, state) = start_gateway(http_tool_config(&upstream.uri())).await;

    // Sweep aggressively for the test.
    mcp_gateway::server::session::spawn_idle_sweeper(
        Arc::clone(&state.activity),
        Arc::clone(&state.store),
        Duration::from_millis(200),
        Duration::from_millis(50),
    );

    let client = reqwest::Client::new();
    let mut frames = open_sse(&client, &format!("{base}/t1/sse")).await;
    let endpoint = next_frame(&mut frames).await;
    assert_eq!(endpoint.event, "endpoint");

    // No activity: the sweeper closes the session and the stream says
    // goodbye with a close event, then ends.
    let frame = tokio::time::timeout(Duration::from_secs(3), frames.recv())
        .await
        .expect("expected close before timeout");
    assert_eq!(frame.map(|f| f.event), Some("close".to_string()));
}

#[tokio::test]
async fn test_reload_endpoint_feeds_notifier() {
    let upstream = MockServer::start().await;
    let (base, state) = start_gateway(http_tool_config(&upstream.uri())).await;

    let mut events = state.notifier.subscribe();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/-/reload"))
        .json(&ConfigEvent::new("t", "cfg", ConfigOp::Update))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.tenant, "t");
    assert_eq!(event.op, ConfigOp::Update);
}

#[tokio::test]
async fn test_health_and_readiness() {
    let upstream = MockServer::start().await;
    let (base, _state) = start_gateway(http_tool_config(&upstream.uri())).await;
    let client = reqwest::Client::new();

    let body: serde_json::Value =
        client.get(format!("{base}/healthz")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let body: serde_json::Value =
        client.get(format!("{base}/readyz")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["prefixes"][0], "t1");
}
