//! In-memory session store for single-replica deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::store::{ChannelConnection, Connection, SessionMeta, SessionStore};

/// Session store backed by a process-local map of bounded channels.
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Arc<ChannelConnection>>>,
    capacity: usize,
}

impl MemoryStore {
    /// Create a store whose session channels hold up to `capacity` queued
    /// messages before `send` blocks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), capacity }
    }

    /// Number of live sessions (for readiness reporting).
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn register(&self, meta: SessionMeta) -> StoreResult<Arc<dyn Connection>> {
        let id = meta.id.clone();
        let conn = Arc::new(ChannelConnection::new(meta, self.capacity));

        let previous = self.sessions.write().await.insert(id.clone(), Arc::clone(&conn));
        if let Some(previous) = previous {
            // A re-register displaces the old queue; close its consumer.
            previous.push_close().await;
            tracing::warn!(session_id = %id, "session re-registered, closing previous queue");
        }

        tracing::debug!(session_id = %id, "registered session");
        Ok(conn)
    }

    async fn get(&self, session_id: &str) -> StoreResult<Arc<dyn Connection>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .map(|c| c as Arc<dyn Connection>)
            .ok_or_else(|| StoreError::session_not_found(session_id))
    }

    async fn unregister(&self, session_id: &str) -> StoreResult<()> {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(conn) = removed {
            conn.push_close().await;
            tracing::debug!(session_id = %session_id, "unregistered session");
        }
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<SessionMeta>> {
        let sessions = self.sessions.read().await;
        let mut metas = Vec::with_capacity(sessions.len());
        for conn in sessions.values() {
            metas.push(conn.meta().await);
        }
        Ok(metas)
    }

    async fn mark_initialized(&self, session_id: &str) -> StoreResult<()> {
        let conn = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::session_not_found(session_id))?;
        conn.set_initialized().await;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("capacity", &self.capacity).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestInfo;
    use crate::store::{Message, SessionType};
    use futures::StreamExt;

    fn meta(id: &str) -> SessionMeta {
        SessionMeta::new(id, "t1", SessionType::Sse, RequestInfo::default())
    }

    #[tokio::test]
    async fn test_register_get_send_receive() {
        let store = MemoryStore::default();
        let conn = store.register(meta("s1")).await.unwrap();

        let producer = store.get("s1").await.unwrap();
        producer.send(Message::new("message", "hello")).await.unwrap();

        let mut stream = conn.subscribe().await.unwrap();
        let received = stream.next().await.unwrap();
        assert_eq!(received.event, "message");
        assert_eq!(received.data, "hello");
    }

    #[tokio::test]
    async fn test_get_unknown_session() {
        let store = MemoryStore::default();
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_closes_stream() {
        let store = MemoryStore::default();
        let conn = store.register(meta("s1")).await.unwrap();
        let mut stream = conn.subscribe().await.unwrap();

        store.unregister("s1").await.unwrap();
        assert!(stream.next().await.is_none());

        // Unknown id is a no-op, not an error.
        store.unregister("s1").await.unwrap();
        store.unregister("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_initialized_visible_via_get() {
        let store = MemoryStore::default();
        store.register(meta("s1")).await.unwrap();
        assert!(!store.get("s1").await.unwrap().meta().await.initialized);

        store.mark_initialized("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().meta().await.initialized);
    }

    #[tokio::test]
    async fn test_list_reports_live_sessions() {
        let store = MemoryStore::default();
        store.register(meta("a")).await.unwrap();
        store.register(meta("b")).await.unwrap();

        let mut ids: Vec<String> = store.list().await.unwrap().into_iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
