//! MCP Gateway - Entry Point
//!
//! Serves the client-facing gateway endpoints and reconciles tenant
//! configs from the management API.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_gateway::config::{NotifierKind, Settings};
use mcp_gateway::control::ControlClient;
use mcp_gateway::model::McpConfig;
use mcp_gateway::notify::{ApiNotifier, Notifier, RedisNotifier, SignalNotifier};
use mcp_gateway::runtime::GatewayRuntime;
use mcp_gateway::server::{AppState, serve};
use mcp_gateway::store::memory::MemoryStore;
use mcp_gateway::store::redis::RedisStore;
use mcp_gateway::store::SessionStore;

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway")]
#[command(about = "Multi-tenant MCP gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the gateway server
    Serve {
        /// Config files (JSON) to activate at startup, in addition to
        /// anything reconciled from the management API
        #[arg(long)]
        config: Vec<String>,
    },
    /// Validate a config file without activating it
    CheckConfig {
        /// Path to a JSON config file
        path: String,
    },
    /// Create or update a config through the management API
    PushConfig {
        /// Path to a JSON config file
        path: String,
    },
    /// Soft-delete a config through the management API
    DeleteConfig {
        /// Tenant the config belongs to
        tenant: String,
        /// Config name
        name: String,
    },
    /// Ask the management API to broadcast a reload for a config
    SyncConfig {
        /// Id of the config to re-read
        config_id: String,
    },
    /// Activate a config on the gateway fleet
    Activate {
        /// Tenant the config belongs to
        tenant: String,
        /// Config name
        name: String,
    },
    /// Upload an OpenAPI document; the management API answers with the
    /// config synthesized from it
    ImportOpenapi {
        /// Path to the OpenAPI document
        path: String,
    },
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Command::Serve { config } => run_serve(config).await,
        Command::CheckConfig { path } => run_check(&path),
        Command::PushConfig { path } => run_push(&path).await,
        Command::DeleteConfig { tenant, name } => run_delete(&tenant, &name).await,
        Command::SyncConfig { config_id } => run_sync(&config_id).await,
        Command::Activate { tenant, name } => run_activate(&tenant, &name).await,
        Command::ImportOpenapi { path } => run_import(&path).await,
    }
}

async fn run_serve(config_paths: Vec<String>) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %settings.gateway_bind,
        "Starting MCP gateway"
    );

    let store: Arc<dyn SessionStore> = match &settings.redis {
        Some(redis) => {
            tracing::info!(prefix = %redis.key_prefix, "using redis session store");
            Arc::new(RedisStore::connect(redis, settings.channel_capacity).await?)
        }
        None => {
            tracing::info!("using in-memory session store");
            Arc::new(MemoryStore::new(settings.channel_capacity))
        }
    };

    let notifier: Arc<dyn Notifier> = match settings.notifier {
        NotifierKind::Signal => Arc::new(SignalNotifier::new()),
        NotifierKind::Redis => {
            let redis = settings
                .redis
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("redis notifier requires REDIS_URL"))?;
            Arc::new(RedisNotifier::connect(redis).await?)
        }
        NotifierKind::Api => Arc::new(ApiNotifier::new(settings.notifier_replicas.clone())),
    };

    let control = match &settings.management_url {
        Some(url) => Some(ControlClient::new(url.clone())?),
        None => None,
    };

    let runtime = Arc::new(GatewayRuntime::new(settings.call_timeout));

    for path in config_paths {
        let config = load_config(&path)?;
        let identity = config.identity();
        match runtime.activate(config).await {
            Ok(()) => tracing::info!(config = %path, "startup config activated"),
            Err(err) => {
                tracing::error!(config = %path, error = %err, "startup activation failed");
                anyhow::bail!("activation of '{}/{}' failed: {err}", identity.0, identity.1);
            }
        }
    }

    let listener = tokio::net::TcpListener::bind(&settings.gateway_bind).await?;
    let state = AppState::new(settings, runtime, store, notifier, control);
    serve(state, listener).await
}

fn run_check(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    config.validate()?;
    println!("{}/{}: ok ({} routers, {} servers, {} tools)",
        config.tenant_name,
        config.name,
        config.routers.len(),
        config.servers.len() + config.http_servers.len(),
        config.tools.len(),
    );
    Ok(())
}

/// Management commands talk to the API named by `MANAGEMENT_API_URL`.
fn control_client() -> anyhow::Result<ControlClient> {
    let url = std::env::var("MANAGEMENT_API_URL")
        .map_err(|_| anyhow::anyhow!("MANAGEMENT_API_URL must be set for management commands"))?;
    ControlClient::new(url)
}

async fn run_push(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    config.validate()?;

    let control = control_client()?;
    let exists = control
        .get_config(&config.tenant_name, &config.name)
        .await?
        .is_some();
    let saved = if exists {
        control.update_config(&config).await?
    } else {
        control.create_config(&config).await?
    };
    println!(
        "{}/{}: {}",
        saved.tenant_name,
        saved.name,
        if exists { "updated" } else { "created" }
    );
    Ok(())
}

async fn run_delete(tenant: &str, name: &str) -> anyhow::Result<()> {
    control_client()?.delete_config(tenant, name).await?;
    println!("{tenant}/{name}: deleted");
    Ok(())
}

async fn run_sync(config_id: &str) -> anyhow::Result<()> {
    control_client()?.sync_config(config_id).await?;
    println!("{config_id}: sync requested");
    Ok(())
}

async fn run_activate(tenant: &str, name: &str) -> anyhow::Result<()> {
    control_client()?.activate(tenant, name).await?;
    println!("{tenant}/{name}: activation requested");
    Ok(())
}

async fn run_import(path: &str) -> anyhow::Result<()> {
    let document = std::fs::read(path).map_err(|e| anyhow::anyhow!("read '{path}': {e}"))?;
    let file_name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "openapi.json".to_string());

    let created = control_client()?.import_openapi(&file_name, document).await?;
    println!(
        "imported {}/{} ({} routers, {} tools)",
        created.tenant_name,
        created.name,
        created.routers.len(),
        created.tools.len()
    );
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<McpConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read '{path}': {e}"))?;
    let config: McpConfig =
        serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parse '{path}': {e}"))?;
    Ok(config)
}
