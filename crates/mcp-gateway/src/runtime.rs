//! Gateway runtime state: the live `prefix → (config, manager)` map.
//!
//! Reads are wait-free: resolving a prefix is one atomic pointer load of an
//! immutable snapshot. Writers (activate / deactivate / reconcile)
//! serialize on a single mutex, build a fresh snapshot and swap it in. A
//! displaced transport manager is stopped only after the sessions created
//! against it have dropped their references, so a hot reload never breaks
//! draining sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use crate::control::ControlClient;
use crate::error::{ConfigError, TransportError};
use crate::model::{McpConfig, Router};
use crate::notify::{ConfigEvent, ConfigOp};
use crate::upstream::TransportManager;

/// Poll interval while waiting for a displaced manager to drain.
const DRAIN_POLL: Duration = Duration::from_secs(5);

/// Activation failure: validation or upstream connect.
#[derive(thiserror::Error, Debug)]
pub enum ActivationError {
    /// The config violated an invariant.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An `on_start` transport failed to connect.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One live routing entry. Sessions capture an `Arc` of this at creation
/// and keep using it across reloads until they disconnect.
pub struct RouteEntry {
    pub tenant: String,
    pub config_name: String,
    pub config: Arc<McpConfig>,
    pub router: Router,
    pub manager: Arc<TransportManager>,
}

impl RouteEntry {
    fn identity(&self) -> (&str, &str) {
        (self.tenant.as_str(), self.config_name.as_str())
    }
}

type Snapshot = HashMap<String, Arc<RouteEntry>>;

/// The gateway's activation state.
pub struct GatewayRuntime {
    snapshot: ArcSwap<Snapshot>,
    /// Writers serialize here; readers never touch it.
    write_lock: Mutex<()>,
    call_timeout: Duration,
}

impl GatewayRuntime {
    /// Create an empty runtime.
    #[must_use]
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
            write_lock: Mutex::new(()),
            call_timeout,
        }
    }

    /// Resolve a request prefix to its routing entry. Wait-free.
    #[must_use]
    pub fn resolve(&self, prefix: &str) -> Option<Arc<RouteEntry>> {
        self.snapshot.load().get(prefix).cloned()
    }

    /// All live prefixes, sorted.
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.snapshot.load().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Activate a config: validate, build and start its transports, then
    /// atomically publish the new snapshot. On failure the current snapshot
    /// is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ActivationError`] on validation or connect failure.
    pub async fn activate(&self, config: McpConfig) -> Result<(), ActivationError> {
        let _guard = self.write_lock.lock().await;

        config.validate()?;

        let identity = (config.tenant_name.clone(), config.name.clone());
        let current = self.snapshot.load_full();

        // A prefix already claimed by a different config is a hard error;
        // re-activating the same identity over its own prefixes is a reload.
        for router in &config.routers {
            for prefix in [router.prefix.as_str(), router.sse_prefix()] {
                if let Some(entry) = current.get(prefix) {
                    if entry.identity() != (identity.0.as_str(), identity.1.as_str()) {
                        return Err(ConfigError::DuplicatePrefix {
                            prefix: prefix.to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        let manager = Arc::new(TransportManager::build(&config, self.call_timeout)?);
        if let Err(err) = manager.start().await {
            // Close whatever already connected before aborting.
            manager.stop().await;
            return Err(err.into());
        }

        let config = Arc::new(config);
        let mut next: Snapshot = (*current).clone();

        // Drop the displaced entries of the same identity, then collect
        // their managers for deferred stop.
        let mut displaced = Vec::new();
        next.retain(|_, entry| {
            if entry.identity() == (identity.0.as_str(), identity.1.as_str()) {
                displaced.push(Arc::clone(&entry.manager));
                false
            } else {
                true
            }
        });

        for router in &config.routers {
            let entry = Arc::new(RouteEntry {
                tenant: identity.0.clone(),
                config_name: identity.1.clone(),
                config: Arc::clone(&config),
                router: router.clone(),
                manager: Arc::clone(&manager),
            });
            next.insert(router.prefix.clone(), Arc::clone(&entry));
            if router.sse_prefix() != router.prefix {
                next.insert(router.sse_prefix().to_string(), entry);
            }
        }

        self.snapshot.store(Arc::new(next));

        displaced.sort_by(|a, b| Arc::as_ptr(a).cmp(&Arc::as_ptr(b)));
        displaced.dedup_by(|a, b| Arc::ptr_eq(a, b));
        for manager in displaced {
            spawn_deferred_stop(manager);
        }

        tracing::info!(
            tenant = %identity.0,
            config = %identity.1,
            "config activated"
        );
        Ok(())
    }

    /// Remove a config's routers and stop its transports once drained.
    pub async fn deactivate(&self, tenant: &str, name: &str) {
        let _guard = self.write_lock.lock().await;

        let current = self.snapshot.load_full();
        let mut next: Snapshot = (*current).clone();
        let mut displaced = Vec::new();
        next.retain(|_, entry| {
            if entry.identity() == (tenant, name) {
                displaced.push(Arc::clone(&entry.manager));
                false
            } else {
                true
            }
        });

        if displaced.is_empty() {
            return;
        }

        self.snapshot.store(Arc::new(next));

        displaced.sort_by(|a, b| Arc::as_ptr(a).cmp(&Arc::as_ptr(b)));
        displaced.dedup_by(|a, b| Arc::ptr_eq(a, b));
        for manager in displaced {
            spawn_deferred_stop(manager);
        }

        tracing::info!(tenant = %tenant, config = %name, "config deactivated");
    }

    /// Reconcile one notifier event against the management API.
    pub async fn handle_event(&self, event: &ConfigEvent, control: &ControlClient) {
        match event.op {
            ConfigOp::Delete => {
                self.deactivate(&event.tenant, &event.name).await;
            }
            ConfigOp::Create | ConfigOp::Update | ConfigOp::Activate => {
                match control.get_config(&event.tenant, &event.name).await {
                    Ok(Some(config)) => {
                        if let Err(err) = self.activate(config).await {
                            tracing::error!(
                                tenant = %event.tenant,
                                config = %event.name,
                                error = %err,
                                "reconcile activation failed"
                            );
                        }
                    }
                    Ok(None) => {
                        // Deleted out from under the event; drop it locally.
                        self.deactivate(&event.tenant, &event.name).await;
                    }
                    Err(err) => {
                        tracing::error!(
                            tenant = %event.tenant,
                            config = %event.name,
                            error = %err,
                            "config fetch failed during reconcile"
                        );
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for GatewayRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRuntime")
            .field("prefixes", &self.prefixes())
            .finish()
    }
}

/// Stop a displaced manager once every session holding it has gone: the
/// last strong reference left is ours.
fn spawn_deferred_stop(manager: Arc<TransportManager>) {
    tokio::spawn(async move {
        loop {
            if Arc::strong_count(&manager) == 1 {
                manager.stop().await;
                tracing::debug!("displaced transport manager stopped");
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    });
}
