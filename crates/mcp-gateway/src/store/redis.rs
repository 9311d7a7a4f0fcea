//! Redis-backed session store with cross-replica fan-out.
//!
//! Metadata lives in a hash `{prefix}:meta:{session_id}` with a TTL and the
//! live ids in a set `{prefix}:sessions`. All replicas share one pub/sub
//! topic `{prefix}:{topic}` carrying `{session_id, event, data}` records:
//! each replica forwards records for the sessions whose consumer it holds
//! into the local channel, so a POST handled by one replica reaches an SSE
//! stream held open on another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::RedisSettings;
use crate::error::{StoreError, StoreResult};
use crate::protocol::RequestInfo;
use crate::store::{
    ChannelConnection, Connection, LocalSessions, Message, MessageStream, SessionMeta,
    SessionStore, SessionType,
};

/// Delay before re-establishing a dropped pub/sub subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// One fan-out record on the shared pub/sub topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FanoutRecord {
    session_id: String,
    event: String,
    data: String,
}

/// Session store backed by Redis.
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
    topic: String,
    ttl_secs: i64,
    capacity: usize,
    local: LocalSessions,
}

impl RedisStore {
    /// Connect to Redis and start the fan-out subscriber task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the server is unreachable.
    pub async fn connect(settings: &RedisSettings, capacity: usize) -> StoreResult<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| StoreError::unavailable(format!("invalid redis url: {e}")))?;
        let manager = client.get_connection_manager().await?;

        let local: LocalSessions = Arc::new(RwLock::new(HashMap::new()));
        let store = Self {
            manager,
            key_prefix: settings.key_prefix.clone(),
            topic: settings.topic.clone(),
            #[allow(clippy::cast_possible_wrap)]
            ttl_secs: settings.ttl.as_secs() as i64,
            capacity,
            local: Arc::clone(&local),
        };

        tokio::spawn(run_subscriber(client, store.topic_key(), local));

        Ok(store)
    }

    fn meta_key(&self, session_id: &str) -> String {
        format!("{}:meta:{}", self.key_prefix, session_id)
    }

    fn sessions_key(&self) -> String {
        format!("{}:sessions", self.key_prefix)
    }

    fn topic_key(&self) -> String {
        format!("{}:{}", self.key_prefix, self.topic)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn register(&self, meta: SessionMeta) -> StoreResult<Arc<dyn Connection>> {
        let id = meta.id.clone();
        let fields = meta_to_fields(&meta)?;
        let conn = Arc::new(ChannelConnection::new(meta, self.capacity));

        self.local.write().await.insert(id.clone(), Arc::clone(&conn));

        let mut redis = self.manager.clone();
        let write = async {
            let _: () = redis.hset_multiple(self.meta_key(&id), &fields).await?;
            let _: () = redis.expire(self.meta_key(&id), self.ttl_secs).await?;
            let _: () = redis.sadd(self.sessions_key(), &id).await?;
            Ok::<(), redis::RedisError>(())
        };
        if let Err(err) = write.await {
            self.local.write().await.remove(&id);
            return Err(err.into());
        }

        tracing::debug!(session_id = %id, "registered session in redis");
        Ok(conn)
    }

    async fn get(&self, session_id: &str) -> StoreResult<Arc<dyn Connection>> {
        if let Some(conn) = self.local.read().await.get(session_id) {
            return Ok(Arc::clone(conn) as Arc<dyn Connection>);
        }

        let mut redis = self.manager.clone();
        let fields: HashMap<String, String> = redis.hgetall(self.meta_key(session_id)).await?;
        if fields.is_empty() {
            return Err(StoreError::session_not_found(session_id));
        }
        let meta = fields_to_meta(session_id, &fields)
            .ok_or_else(|| StoreError::session_not_found(session_id))?;

        Ok(Arc::new(RemoteConnection {
            manager: self.manager.clone(),
            topic: self.topic_key(),
            meta,
        }))
    }

    async fn unregister(&self, session_id: &str) -> StoreResult<()> {
        let mut redis = self.manager.clone();
        let _: () = redis.del(self.meta_key(session_id)).await?;
        let _: () = redis.srem(self.sessions_key(), session_id).await?;

        // Publish the close sentinel so the replica holding the consumer
        // terminates its stream.
        let record = FanoutRecord {
            session_id: session_id.to_string(),
            event: Message::close().event,
            data: String::new(),
        };
        let _: () = redis.publish(self.topic_key(), serde_json::to_string(&record)?).await?;

        if let Some(conn) = self.local.write().await.remove(session_id) {
            conn.push_close().await;
        }
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<SessionMeta>> {
        let mut redis = self.manager.clone();
        let ids: Vec<String> = redis.smembers(self.sessions_key()).await?;
        let mut metas = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = redis.hgetall(self.meta_key(&id)).await?;
            if let Some(meta) = fields_to_meta(&id, &fields) {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    async fn mark_initialized(&self, session_id: &str) -> StoreResult<()> {
        let mut redis = self.manager.clone();
        let exists: bool = redis.exists(self.meta_key(session_id)).await?;
        if !exists {
            return Err(StoreError::session_not_found(session_id));
        }
        let _: () = redis.hset(self.meta_key(session_id), "initialized", "1").await?;

        if let Some(conn) = self.local.read().await.get(session_id) {
            conn.set_initialized().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("topic", &self.topic)
            .finish()
    }
}

/// Producer handle for a session whose consumer lives on another replica.
/// `send` publishes to the shared topic; it cannot consume.
struct RemoteConnection {
    manager: ConnectionManager,
    topic: String,
    meta: SessionMeta,
}

#[async_trait]
impl Connection for RemoteConnection {
    async fn meta(&self) -> SessionMeta {
        self.meta.clone()
    }

    async fn send(&self, message: Message) -> StoreResult<()> {
        let record = FanoutRecord {
            session_id: self.meta.id.clone(),
            event: message.event,
            data: message.data,
        };
        let mut redis = self.manager.clone();
        let _: () = redis.publish(&self.topic, serde_json::to_string(&record)?).await?;
        Ok(())
    }

    async fn subscribe(&self) -> StoreResult<MessageStream> {
        Err(StoreError::unavailable(
            "remote session handle cannot consume; the owning replica holds the stream",
        ))
    }
}

/// Long-lived subscriber: forwards topic records into locally held session
/// channels. A malformed payload is logged and dropped; the subscription
/// survives. A dropped connection is re-established after a short delay.
async fn run_subscriber(client: redis::Client, topic: String, local: LocalSessions) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.subscribe(&topic).await {
                    tracing::warn!(error = %err, topic = %topic, "pubsub subscribe failed");
                } else {
                    tracing::debug!(topic = %topic, "session fan-out subscriber running");
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(err) => {
                                tracing::warn!(error = %err, "unreadable pubsub payload, dropped");
                                continue;
                            }
                        };
                        match serde_json::from_str::<FanoutRecord>(&payload) {
                            Ok(record) => forward_record(&local, record).await,
                            Err(err) => {
                                tracing::warn!(error = %err, "malformed fan-out record, dropped");
                            }
                        }
                    }
                    tracing::warn!(topic = %topic, "pubsub stream ended, resubscribing");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "pubsub connect failed");
            }
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn forward_record(local: &LocalSessions, record: FanoutRecord) {
    let message = Message::new(record.event, record.data);

    if message.is_close() {
        let removed = local.write().await.remove(&record.session_id);
        if let Some(conn) = removed {
            conn.push_close().await;
        }
        return;
    }

    let conn = local.read().await.get(&record.session_id).cloned();
    if let Some(conn) = conn {
        if conn.send(message).await.is_err() {
            tracing::debug!(session_id = %record.session_id, "local session gone, dropping record");
        }
    }
}

fn meta_to_fields(meta: &SessionMeta) -> StoreResult<Vec<(&'static str, String)>> {
    Ok(vec![
        ("prefix", meta.prefix.clone()),
        ("type", meta.session_type.as_str().to_string()),
        ("created_at", meta.created_at.to_rfc3339()),
        ("initialized", if meta.initialized { "1" } else { "0" }.to_string()),
        ("request", serde_json::to_string(&meta.request)?),
    ])
}

fn fields_to_meta(id: &str, fields: &HashMap<String, String>) -> Option<SessionMeta> {
    let session_type = match fields.get("type").map(String::as_str) {
        Some("streamable") => SessionType::Streamable,
        Some("sse") => SessionType::Sse,
        _ => return None,
    };
    let created_at = fields
        .get("created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
    let request = fields
        .get("request")
        .and_then(|s| serde_json::from_str::<RequestInfo>(s).ok())
        .unwrap_or_default();

    Some(SessionMeta {
        id: id.to_string(),
        prefix: fields.get("prefix")?.clone(),
        session_type,
        created_at,
        initialized: fields.get("initialized").map(String::as_str) == Some("1"),
        request,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_field_roundtrip() {
        let mut request = RequestInfo::default();
        request.headers.insert("x-api-key".to_string(), "k".to_string());
        let meta = SessionMeta::new("s1", "t1", SessionType::Sse, request);

        let fields: HashMap<String, String> = meta_to_fields(&meta)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = fields_to_meta("s1", &fields).unwrap();

        assert_eq!(back.id, "s1");
        assert_eq!(back.prefix, "t1");
        assert_eq!(back.session_type, SessionType::Sse);
        assert!(!back.initialized);
        assert_eq!(back.request.headers.get("x-api-key").unwrap(), "k");
    }

    #[test]
    fn test_meta_parse_rejects_missing_type() {
        let fields = HashMap::from([("prefix".to_string(), "t1".to_string())]);
        assert!(fields_to_meta("s1", &fields).is_none());
    }

    #[test]
    fn test_fanout_record_wire_shape() {
        let record = FanoutRecord {
            session_id: "s1".to_string(),
            event: "message".to_string(),
            data: "{\"jsonrpc\":\"2.0\"}".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["event"], "message");

        let malformed = serde_json::from_str::<FanoutRecord>("{\"nope\":1}");
        assert!(malformed.is_err());
    }

    #[tokio::test]
    async fn test_forward_record_close_removes_local_session() {
        let local: LocalSessions = Arc::new(RwLock::new(HashMap::new()));
        let meta = SessionMeta::new("s1", "t1", SessionType::Sse, RequestInfo::default());
        let conn = Arc::new(ChannelConnection::new(meta, 4));
        local.write().await.insert("s1".to_string(), Arc::clone(&conn));

        let mut stream = conn.subscribe().await.unwrap();

        forward_record(
            &local,
            FanoutRecord {
                session_id: "s1".to_string(),
                event: "message".to_string(),
                data: "hi".to_string(),
            },
        )
        .await;
        forward_record(
            &local,
            FanoutRecord {
                session_id: "s1".to_string(),
                event: Message::close().event,
                data: String::new(),
            },
        )
        .await;

        use futures::StreamExt as _;
        assert_eq!(stream.next().await.unwrap().data, "hi");
        assert!(stream.next().await.is_none());
        assert!(local.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_forward_record_unknown_session_is_dropped() {
        let local: LocalSessions = Arc::new(RwLock::new(HashMap::new()));
        forward_record(
            &local,
            FanoutRecord {
                session_id: "ghost".to_string(),
                event: "message".to_string(),
                data: "x".to_string(),
            },
        )
        .await;
        assert!(local.read().await.is_empty());
    }
}
