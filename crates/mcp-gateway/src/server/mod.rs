//! Client-facing gateway server.
//!
//! One axum app serves every active router: prefixes are resolved per
//! request against the runtime snapshot, so activations and reloads never
//! rebuild the HTTP stack. Besides the three MCP endpoints per prefix the
//! app exposes health/readiness probes and the reload sink used by the
//! `api` notifier variant.

pub mod cors;
pub mod session;
pub mod sse;
pub mod streamable;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::config::{Settings, defaults};
use crate::control::ControlClient;
use crate::error::{GatewayError, StoreError};
use crate::notify::Notifier;
use crate::protocol::{JsonRpcResponse, RequestInfo};
use crate::runtime::GatewayRuntime;
use crate::server::session::ActivityTracker;
use crate::store::SessionStore;

/// Shared state of the gateway app.
pub struct AppState {
    pub settings: Settings,
    pub runtime: Arc<GatewayRuntime>,
    pub store: Arc<dyn SessionStore>,
    pub notifier: Arc<dyn Notifier>,
    pub activity: Arc<ActivityTracker>,
    pub control: Option<ControlClient>,
}

impl AppState {
    /// Assemble the state object threaded through every handler.
    #[must_use]
    pub fn new(
        settings: Settings,
        runtime: Arc<GatewayRuntime>,
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn Notifier>,
        control: Option<ControlClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            runtime,
            store,
            notifier,
            activity: Arc::new(ActivityTracker::new()),
            control,
        })
    }
}

/// Build the gateway router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/-/reload", post(handle_reload))
        .route("/{prefix}/sse", get(sse::handle_sse).options(sse::handle_preflight))
        .route(
            "/{prefix}/message",
            post(sse::handle_message).options(sse::handle_preflight),
        )
        .route(
            "/{prefix}/mcp",
            post(streamable::handle_mcp).options(sse::handle_preflight),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway on an already bound listener until ctrl-c.
///
/// # Errors
///
/// Returns error on server failure.
pub async fn serve(state: Arc<AppState>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    session::spawn_idle_sweeper(
        Arc::clone(&state.activity),
        Arc::clone(&state.store),
        state.settings.idle_timeout,
        defaults::SWEEP_INTERVAL,
    );
    spawn_reconciler(Arc::clone(&state));

    let router = build_router(state);
    tracing::info!("gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C handler");
    tracing::info!("Received shutdown signal");
}

/// Apply notifier events to the runtime for as long as the process lives.
pub fn spawn_reconciler(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = state.notifier.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::info!(
                        tenant = %event.tenant,
                        config = %event.name,
                        op = ?event.op,
                        "config event received"
                    );
                    match &state.control {
                        Some(control) => state.runtime.handle_event(&event, control).await,
                        None => {
                            // Without a management API there is nothing to
                            // re-read; only deletes can be applied.
                            if event.op == crate::notify::ConfigOp::Delete {
                                state.runtime.deactivate(&event.tenant, &event.name).await;
                            } else {
                                tracing::warn!(
                                    "config event ignored: no management API configured"
                                );
                            }
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "reconciler lagged behind config events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": defaults::SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.activity.len().await;
    Json(serde_json::json!({
        "status": "ready",
        "service": defaults::SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "prefixes": state.runtime.prefixes(),
        "sessions": sessions
    }))
}

/// Reload sink for the `api` notifier: the management API POSTs a config
/// event here and this replica reconciles.
async fn handle_reload(
    State(state): State<Arc<AppState>>,
    Json(event): Json<crate::notify::ConfigEvent>,
) -> impl IntoResponse {
    state.notifier.deliver(event);
    StatusCode::ACCEPTED
}

/// Freeze the parts of the initiating request that tool templates may
/// reference for the session's lifetime.
#[must_use]
pub fn capture_request_info(
    headers: &HeaderMap,
    queries: &HashMap<String, String>,
) -> RequestInfo {
    let mut info = RequestInfo::default();

    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            info.headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    info.queries = queries.clone();

    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE) {
        if let Ok(raw) = cookie_header.to_str() {
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    info.cookies.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
    }

    info
}

/// Build the JSON-RPC error object for a gateway failure.
#[must_use]
pub fn error_response(id: Option<serde_json::Value>, err: &GatewayError) -> JsonRpcResponse {
    JsonRpcResponse::error_with_data(id, err.rpc_code(), err.to_string(), err.rpc_data())
}

/// HTTP status for a store failure outside the JSON-RPC path.
#[must_use]
pub fn store_error_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Closed | StoreError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
