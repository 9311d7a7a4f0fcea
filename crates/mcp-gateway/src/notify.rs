//! Config-change notification fan-out.
//!
//! After a successful write to the management API, every gateway replica
//! must eventually receive one or more [`ConfigEvent`]s and reconcile.
//! Three variants cover the deployment shapes: an in-process channel for a
//! single replica, a Redis pub/sub topic, and direct HTTP pushes from the
//! management API to each replica's reload endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::RedisSettings;

/// Broadcast buffer for pending events per subscriber.
const EVENT_BUFFER: usize = 16;

/// Delay before re-establishing a dropped pub/sub subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// What happened to a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOp {
    Create,
    Update,
    Delete,
    Activate,
}

/// One config-change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEvent {
    pub tenant: String,
    pub name: String,
    pub op: ConfigOp,
}

impl ConfigEvent {
    /// Build an event.
    #[must_use]
    pub fn new(tenant: impl Into<String>, name: impl Into<String>, op: ConfigOp) -> Self {
        Self { tenant: tenant.into(), name: name.into(), op }
    }
}

/// Distributes config-change events to gateway replicas.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce an event to every replica (including this one).
    async fn publish(&self, event: ConfigEvent) -> anyhow::Result<()>;

    /// Deliver an event to this replica only. Used by the reload endpoint
    /// when the management API pushes directly.
    fn deliver(&self, event: ConfigEvent);

    /// Subscribe to events delivered to this replica.
    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent>;
}

/// In-process notifier for single-replica deployments.
pub struct SignalNotifier {
    tx: broadcast::Sender<ConfigEvent>,
}

impl SignalNotifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }
}

impl Default for SignalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for SignalNotifier {
    async fn publish(&self, event: ConfigEvent) -> anyhow::Result<()> {
        self.deliver(event);
        Ok(())
    }

    fn deliver(&self, event: ConfigEvent) {
        // No subscribers yet is fine; the event is simply dropped.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.tx.subscribe()
    }
}

/// Redis pub/sub notifier shared by all replicas.
pub struct RedisNotifier {
    manager: redis::aio::ConnectionManager,
    topic: String,
    tx: broadcast::Sender<ConfigEvent>,
}

impl RedisNotifier {
    /// Connect and start the subscriber task.
    ///
    /// # Errors
    ///
    /// Returns an error when Redis is unreachable.
    pub async fn connect(settings: &RedisSettings) -> anyhow::Result<Self> {
        let client = redis::Client::open(settings.url.as_str())?;
        let manager = client.get_connection_manager().await?;
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        let topic = format!("{}:config", settings.key_prefix);

        tokio::spawn(run_subscriber(client, topic.clone(), tx.clone()));

        Ok(Self { manager, topic, tx })
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(&self, event: ConfigEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.manager.clone();
        let _: () = conn.publish(&self.topic, payload).await?;
        Ok(())
    }

    fn deliver(&self, event: ConfigEvent) {
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.tx.subscribe()
    }
}

async fn run_subscriber(
    client: redis::Client,
    topic: String,
    tx: broadcast::Sender<ConfigEvent>,
) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.subscribe(&topic).await {
                    tracing::warn!(error = %err, topic = %topic, "config subscribe failed");
                } else {
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(err) => {
                                tracing::warn!(error = %err, "unreadable config event, dropped");
                                continue;
                            }
                        };
                        match serde_json::from_str::<ConfigEvent>(&payload) {
                            Ok(event) => {
                                let _ = tx.send(event);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "malformed config event, dropped");
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "config pubsub connect failed");
            }
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

/// HTTP-push notifier: the management side POSTs each event to every known
/// replica's `/-/reload` endpoint; the receiving gateway feeds it into its
/// local channel via [`Notifier::deliver`].
pub struct ApiNotifier {
    http: reqwest::Client,
    replicas: Vec<String>,
    tx: broadcast::Sender<ConfigEvent>,
}

impl ApiNotifier {
    /// Build a notifier targeting the given replica base URLs.
    #[must_use]
    pub fn new(replicas: Vec<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { http: reqwest::Client::new(), replicas, tx }
    }

    /// The reload URL for one replica base.
    fn reload_url(base: &str) -> String {
        format!("{}/-/reload", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Notifier for ApiNotifier {
    async fn publish(&self, event: ConfigEvent) -> anyhow::Result<()> {
        for replica in &self.replicas {
            let url = Self::reload_url(replica);
            match self.http.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(replica = %url, status = %response.status(), "reload push rejected");
                }
                Err(err) => {
                    tracing::warn!(replica = %url, error = %err, "reload push failed");
                }
            }
        }
        // The local replica reconciles without going through HTTP.
        self.deliver(event);
        Ok(())
    }

    fn deliver(&self, event: ConfigEvent) {
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.tx.subscribe()
    }
}
