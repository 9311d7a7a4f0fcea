//! Session store: per-session message queues with pluggable backends.
//!
//! Two implementations share one interface: [`memory::MemoryStore`] for
//! single-replica deployments and [`redis::RedisStore`] for cross-replica
//! fan-out. A producer obtains a [`Connection`] via [`SessionStore::get`]
//! and pushes [`Message`]s; the SSE writer holding the session consumes them
//! in send order through [`Connection::subscribe`].

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{StoreError, StoreResult};
use crate::protocol::RequestInfo;

/// SSE event name of the close sentinel that terminates a session stream.
pub const CLOSE_EVENT: &str = "close";

/// One message queued for delivery to a session's client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// SSE event name (`endpoint`, `message`, `close`, ...).
    pub event: String,
    /// Event payload, already serialized.
    pub data: String,
}

impl Message {
    /// Build a message.
    #[must_use]
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: event.into(), data: data.into() }
    }

    /// The close sentinel. Consumers stop after seeing it.
    #[must_use]
    pub fn close() -> Self {
        Self { event: CLOSE_EVENT.to_string(), data: String::new() }
    }

    /// True for the close sentinel.
    #[must_use]
    pub fn is_close(&self) -> bool {
        self.event == CLOSE_EVENT
    }
}

/// Transport flavor of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Sse,
    Streamable,
}

impl SessionType {
    /// Wire name used in persisted metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Streamable => "streamable",
        }
    }
}

/// Session metadata, frozen at creation except for the `initialized` bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    /// The router prefix the session was created against.
    pub prefix: String,
    pub session_type: SessionType,
    pub created_at: DateTime<Utc>,
    /// Set once the client completes a successful `initialize`.
    pub initialized: bool,
    /// Captured headers/queries/cookies of the initiating request.
    pub request: RequestInfo,
}

impl SessionMeta {
    /// Build metadata for a fresh session.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        prefix: impl Into<String>,
        session_type: SessionType,
        request: RequestInfo,
    ) -> Self {
        Self {
            id: id.into(),
            prefix: prefix.into(),
            session_type,
            created_at: Utc::now(),
            initialized: false,
            request,
        }
    }
}

/// The consumer side of a session: a finite stream ending at the close
/// sentinel (the sentinel itself is not yielded).
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Producer/consumer handle for one session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Current session metadata.
    async fn meta(&self) -> SessionMeta;

    /// Queue a message for the session's client. Blocks when the bounded
    /// channel is full, propagating backpressure to the producer.
    async fn send(&self, message: Message) -> StoreResult<()>;

    /// Take the consumer stream. May be taken once per session; subsequent
    /// calls fail with [`StoreError::Closed`].
    async fn subscribe(&self) -> StoreResult<MessageStream>;
}

/// Pluggable session storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session and its local queue.
    async fn register(&self, meta: SessionMeta) -> StoreResult<Arc<dyn Connection>>;

    /// Resolve a live session for producing. On the Redis backend this may
    /// be a remote handle that publishes instead of queueing locally.
    async fn get(&self, session_id: &str) -> StoreResult<Arc<dyn Connection>>;

    /// Remove a session, delivering a close sentinel to its consumer.
    /// Unregistering an unknown id is a no-op.
    async fn unregister(&self, session_id: &str) -> StoreResult<()>;

    /// Metadata of all live sessions known to this store.
    async fn list(&self) -> StoreResult<Vec<SessionMeta>>;

    /// Flip the session's `initialized` bit after a successful `initialize`.
    async fn mark_initialized(&self, session_id: &str) -> StoreResult<()>;
}

/// Bounded-channel connection used for locally held sessions by both
/// backends.
pub struct ChannelConnection {
    meta: RwLock<SessionMeta>,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl ChannelConnection {
    /// Create a connection with the given channel capacity.
    #[must_use]
    pub fn new(meta: SessionMeta, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { meta: RwLock::new(meta), tx, rx: Mutex::new(Some(rx)) }
    }

    /// Deliver the close sentinel, bounded so unregister cannot hang on a
    /// full channel with a stalled consumer.
    pub async fn push_close(&self) {
        let _ = tokio::time::timeout(Duration::from_secs(1), self.tx.send(Message::close())).await;
    }

    /// Update the `initialized` bit on the cached metadata.
    pub async fn set_initialized(&self) {
        self.meta.write().await.initialized = true;
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn meta(&self) -> SessionMeta {
        self.meta.read().await.clone()
    }

    async fn send(&self, message: Message) -> StoreResult<()> {
        self.tx.send(message).await.map_err(|_| StoreError::Closed)
    }

    async fn subscribe(&self) -> StoreResult<MessageStream> {
        let receiver = self.rx.lock().await.take().ok_or(StoreError::Closed)?;
        let stream = ReceiverStream::new(receiver);
        let stream = tokio_stream::StreamExt::take_while(stream, |m: &Message| !m.is_close());
        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection").finish()
    }
}

/// Shared map of locally-held connections, keyed by session id.
pub(crate) type LocalSessions = Arc<RwLock<HashMap<String, Arc<ChannelConnection>>>>;
