//! Per-replica session activity tracking and the idle sweeper.
//!
//! The replica that holds a session's consumer stream is the one that
//! enforces its idle timeout. Activity is touched on every delivered
//! message and every client POST; the sweeper unregisters sessions whose
//! last activity is older than the configured idle timeout, which pushes
//! the close sentinel and terminates the SSE writer with a final `close`
//! event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::store::SessionStore;

/// Tracks the last activity instant of locally held sessions.
#[derive(Default)]
pub struct ActivityTracker {
    last_active: Mutex<HashMap<String, Instant>>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for a session.
    pub async fn touch(&self, session_id: &str) {
        self.last_active
            .lock()
            .await
            .insert(session_id.to_string(), Instant::now());
    }

    /// Forget a session.
    pub async fn remove(&self, session_id: &str) {
        self.last_active.lock().await.remove(session_id);
    }

    /// Session ids idle longer than `timeout`.
    pub async fn expired(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.last_active
            .lock()
            .await
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of tracked sessions.
    pub async fn len(&self) -> usize {
        self.last_active.lock().await.len()
    }

    /// True when no session is tracked.
    pub async fn is_empty(&self) -> bool {
        self.last_active.lock().await.is_empty()
    }
}

/// Periodically close sessions that exceeded the idle timeout.
pub fn spawn_idle_sweeper(
    activity: Arc<ActivityTracker>,
    store: Arc<dyn SessionStore>,
    idle_timeout: Duration,
    sweep_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            for session_id in activity.expired(idle_timeout).await {
                tracing::info!(session_id = %session_id, "closing idle session");
                if let Err(err) = store.unregister(&session_id).await {
                    tracing::warn!(session_id = %session_id, error = %err, "idle unregister failed");
                }
                activity.remove(&session_id).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestInfo;
    use crate::store::memory::MemoryStore;
    use crate::store::{SessionMeta, SessionType};

    #[tokio::test]
    async fn test_touch_and_expire() {
        let tracker = ActivityTracker::new();
        tracker.touch("s1").await;
        assert_eq!(tracker.len().await, 1);

        // Fresh activity does not expire under a generous timeout.
        assert!(tracker.expired(Duration::from_secs(60)).await.is_empty());

        // A zero timeout expires everything already touched.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = tracker.expired(Duration::ZERO).await;
        assert_eq!(expired, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_untracks() {
        let tracker = ActivityTracker::new();
        tracker.touch("s1").await;
        tracker.remove("s1").await;
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweeper_unregisters_idle_sessions() {
        let tracker = Arc::new(ActivityTracker::new());
        let store = Arc::new(MemoryStore::default());

        store
            .register(SessionMeta::new("s1", "t1", SessionType::Sse, RequestInfo::default()))
            .await
            .unwrap();
        tracker.touch("s1").await;

        let handle = spawn_idle_sweeper(
            Arc::clone(&tracker),
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Duration::from_millis(10),
            Duration::from_millis(20),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(tracker.is_empty().await);
        assert!(store.get("s1").await.is_err(), "idle session was unregistered");
    }
}
