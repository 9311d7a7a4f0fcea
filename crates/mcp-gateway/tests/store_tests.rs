//! Session store behavior: round-trips, ordering, lifecycle edges and
//! backpressure on the bounded channel.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mcp_gateway::error::StoreError;
use mcp_gateway::protocol::RequestInfo;
use mcp_gateway::store::memory::MemoryStore;
use mcp_gateway::store::{Message, SessionMeta, SessionStore, SessionType};

fn meta(id: &str, prefix: &str) -> SessionMeta {
    SessionMeta::new(id, prefix, SessionType::Sse, RequestInfo::default())
}

#[tokio::test]
async fn test_register_send_receive_roundtrip() {
    let store = MemoryStore::default();
    let consumer = store.register(meta("s1", "t1")).await.unwrap();

    let producer = store.get("s1").await.unwrap();
    producer.send(Message::new("message", "payload")).await.unwrap();

    let mut stream = consumer.subscribe().await.unwrap();
    let received = stream.next().await.unwrap();
    assert_eq!(received, Message::new("message", "payload"));
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let store = MemoryStore::new(128);
    let consumer = store.register(meta("s1", "t1")).await.unwrap();
    let producer = store.get("s1").await.unwrap();

    for i in 0..50 {
        producer.send(Message::new("message", i.to_string())).await.unwrap();
    }
    store.unregister("s1").await.unwrap();

    let received: Vec<Message> = consumer.subscribe().await.unwrap().collect().await;
    assert_eq!(received.len(), 50);
    for (i, message) in received.iter().enumerate() {
        assert_eq!(message.data, i.to_string(), "message {i} out of order");
    }
}

#[tokio::test]
async fn test_concurrent_producers_all_delivered() {
    let store = Arc::new(MemoryStore::new(256));
    let consumer = store.register(meta("s1", "t1")).await.unwrap();

    let mut handles = Vec::new();
    for p in 0..4 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let producer = store.get("s1").await.unwrap();
            for i in 0..25 {
                producer
                    .send(Message::new("message", format!("{p}:{i}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    store.unregister("s1").await.unwrap();

    let received: Vec<Message> = consumer.subscribe().await.unwrap().collect().await;
    assert_eq!(received.len(), 100);

    // Per-producer FIFO survives interleaving.
    for p in 0..4 {
        let ours: Vec<&str> = received
            .iter()
            .filter_map(|m| m.data.strip_prefix(&format!("{p}:")))
            .collect();
        let expected: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        assert_eq!(ours, expected, "producer {p} reordered");
    }
}

#[tokio::test]
async fn test_unregister_unknown_is_noop() {
    let store = MemoryStore::default();
    store.unregister("never-existed").await.unwrap();
}

#[tokio::test]
async fn test_unregister_terminates_consumer() {
    let store = MemoryStore::default();
    let consumer = store.register(meta("s1", "t1")).await.unwrap();
    let mut stream = consumer.subscribe().await.unwrap();

    store.unregister("s1").await.unwrap();
    assert!(stream.next().await.is_none());

    assert!(matches!(
        store.get("s1").await,
        Err(StoreError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_full_channel_applies_backpressure() {
    let store = MemoryStore::new(2);
    let _consumer = store.register(meta("s1", "t1")).await.unwrap();
    let producer = store.get("s1").await.unwrap();

    producer.send(Message::new("message", "1")).await.unwrap();
    producer.send(Message::new("message", "2")).await.unwrap();

    // Third send blocks until someone consumes; it must not be dropped.
    let blocked = tokio::time::timeout(
        Duration::from_millis(100),
        producer.send(Message::new("message", "3")),
    )
    .await;
    assert!(blocked.is_err(), "send on a full channel should block, not drop");
}

#[tokio::test]
async fn test_initialized_bit_travels_through_store() {
    let store = MemoryStore::default();
    store.register(meta("s1", "t1")).await.unwrap();

    assert!(!store.get("s1").await.unwrap().meta().await.initialized);
    store.mark_initialized("s1").await.unwrap();
    assert!(store.get("s1").await.unwrap().meta().await.initialized);

    assert!(matches!(
        store.mark_initialized("ghost").await,
        Err(StoreError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_list_and_session_metadata() {
    let store = MemoryStore::default();
    let mut request = RequestInfo::default();
    request.headers.insert("x-tenant".to_string(), "acme".to_string());
    store
        .register(SessionMeta::new("s1", "t1", SessionType::Streamable, request))
        .await
        .unwrap();

    let sessions = store.list().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].prefix, "t1");
    assert_eq!(sessions[0].session_type, SessionType::Streamable);
    assert_eq!(sessions[0].request.headers.get("x-tenant").unwrap(), "acme");
}
