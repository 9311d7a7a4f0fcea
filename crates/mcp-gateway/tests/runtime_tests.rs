//! Runtime snapshot behavior: activation validation, atomic swap, hot
//! reload draining, and deactivation.

use std::collections::HashMap;
use std::time::Duration;

use mcp_gateway::error::ConfigError;
use mcp_gateway::model::{HttpServer, McpConfig, Router, Tool};
use mcp_gateway::runtime::{ActivationError, GatewayRuntime};

fn tool(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: format!("tool {name}"),
        method: "GET".to_string(),
        path: "\"/x\"".to_string(),
        headers: HashMap::new(),
        args: vec![],
        input_schema: serde_json::json!({"type": "object"}),
        request_body: String::new(),
        response_body: String::new(),
    }
}

fn http_config(tenant: &str, name: &str, prefix: &str, tool_name: &str) -> McpConfig {
    McpConfig {
        name: name.to_string(),
        tenant_name: tenant.to_string(),
        servers: vec![],
        routers: vec![Router {
            prefix: prefix.to_string(),
            server: "svc".to_string(),
            sse_prefix: None,
            cors: None,
        }],
        tools: vec![tool(tool_name)],
        http_servers: vec![HttpServer {
            name: "svc".to_string(),
            description: String::new(),
            url: "http://127.0.0.1:9".to_string(),
            tools: vec![tool_name.to_string()],
        }],
        created_at: None,
        updated_at: None,
        deleted_at: None,
    }
}

fn runtime() -> GatewayRuntime {
    GatewayRuntime::new(Duration::from_secs(2))
}

#[tokio::test]
async fn test_activate_then_resolve() {
    let runtime = runtime();
    runtime.activate(http_config("t", "cfg", "t1", "echo")).await.unwrap();

    let entry = runtime.resolve("t1").expect("prefix resolves after activation");
    assert_eq!(entry.tenant, "t");
    assert_eq!(entry.config_name, "cfg");

    assert!(runtime.resolve("unknown").is_none());
}

#[tokio::test]
async fn test_activation_rejects_dangling_server() {
    let runtime = runtime();
    let mut config = http_config("t", "cfg", "t1", "echo");
    config.routers[0].server = "missing".to_string();

    let err = runtime.activate(config).await.unwrap_err();
    assert!(matches!(
        err,
        ActivationError::Config(ConfigError::DanglingServer { .. })
    ));
    assert!(runtime.resolve("t1").is_none(), "failed activation must not publish");
}

#[tokio::test]
async fn test_prefix_conflict_between_configs_rejected() {
    let runtime = runtime();
    runtime.activate(http_config("t", "first", "shared", "echo")).await.unwrap();

    let err = runtime
        .activate(http_config("t", "second", "shared", "other"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ActivationError::Config(ConfigError::DuplicatePrefix { .. })
    ));

    // The loser did not displace the winner.
    let entry = runtime.resolve("shared").unwrap();
    assert_eq!(entry.config_name, "first");
}

#[tokio::test]
async fn test_double_activation_is_idempotent() {
    let runtime = runtime();
    runtime.activate(http_config("t", "cfg", "t1", "echo")).await.unwrap();
    let before = runtime.prefixes();
    let tools_before = runtime.resolve("t1").unwrap().manager.fetch_all_tools().await.unwrap();

    runtime.activate(http_config("t", "cfg", "t1", "echo")).await.unwrap();
    let after = runtime.prefixes();
    let tools_after = runtime.resolve("t1").unwrap().manager.fetch_all_tools().await.unwrap();

    assert_eq!(before, after);
    let names = |tools: &[mcp_gateway::protocol::ToolInfo]| {
        tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&tools_before), names(&tools_after));
}

#[tokio::test]
async fn test_hot_reload_drains_old_entry() {
    let runtime = runtime();
    runtime.activate(http_config("t", "cfg", "t1", "tool_v1")).await.unwrap();

    // A session captures the entry at creation time.
    let session_entry = runtime.resolve("t1").unwrap();

    runtime.activate(http_config("t", "cfg", "t1", "tool_v2")).await.unwrap();

    // The draining session keeps seeing v1 through its captured entry.
    let old_tools = session_entry.manager.fetch_all_tools().await.unwrap();
    assert_eq!(old_tools[0].name, "tool_v1");

    // A new session sees v2.
    let fresh_entry = runtime.resolve("t1").unwrap();
    let new_tools = fresh_entry.manager.fetch_all_tools().await.unwrap();
    assert_eq!(new_tools[0].name, "tool_v2");
}

#[tokio::test]
async fn test_deactivate_removes_prefixes() {
    let runtime = runtime();
    runtime.activate(http_config("t", "cfg", "t1", "echo")).await.unwrap();
    assert!(runtime.resolve("t1").is_some());

    runtime.deactivate("t", "cfg").await;
    assert!(runtime.resolve("t1").is_none());
    assert!(runtime.prefixes().is_empty());

    // Deactivating again is harmless.
    runtime.deactivate("t", "cfg").await;
}

#[tokio::test]
async fn test_sse_prefix_alias_resolves() {
    let runtime = runtime();
    let mut config = http_config("t", "cfg", "t1", "echo");
    config.routers[0].sse_prefix = Some("t1-events".to_string());
    runtime.activate(config).await.unwrap();

    assert!(runtime.resolve("t1").is_some());
    assert!(runtime.resolve("t1-events").is_some());
}
