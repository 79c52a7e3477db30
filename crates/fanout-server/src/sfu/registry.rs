use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use super::session::Session;
use crate::error::{Result, SfuError};

/// Live sessions by ID. At most one open session exists per ID.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
    max_listed_subscribers: usize,
}

impl SessionRegistry {
    pub fn new(max_listed_subscribers: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            max_listed_subscribers,
        })
    }

    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .get(&id)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Return the open session for `id`, creating it if needed. A closed
    /// session still in the map is replaced.
    pub fn get_or_create(self: &Arc<Self>, id: u32) -> Arc<Session> {
        let mut sessions = self.sessions.write();

        if let Some(session) = sessions.get(&id) {
            if !session.is_closed() {
                return session.clone();
            }
        }

        let session = Session::with_stats_threshold(id, self.max_listed_subscribers);
        sessions.insert(id, session.clone());
        drop(sessions);

        let registry = Arc::downgrade(self);
        let closing = Arc::downgrade(&session);
        session.on_close(move || {
            if let Some(registry) = registry.upgrade() {
                registry.evict(id, &closing);
            }
        });

        tracing::info!("Created session {}", id);
        session
    }

    /// Run `join` against the open session for `id`. When the session closes
    /// between lookup and join, a fresh session is created and `join` runs
    /// again.
    pub async fn join<T, F, Fut>(self: &Arc<Self>, id: u32, mut join: F) -> Result<T>
    where
        F: FnMut(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let session = self.get_or_create(id);
            match join(session).await {
                Err(SfuError::SessionClosed(closed)) if closed == id => {
                    tracing::debug!("Session {} closed while joining, retrying", id);
                }
                joined => return joined,
            }
        }
    }

    /// Remove `id` if it still maps to `session`
    fn evict(&self, id: u32, session: &Weak<Session>) {
        let mut sessions = self.sessions.write();
        let same = sessions
            .get(&id)
            .is_some_and(|current| Weak::ptr_eq(&Arc::downgrade(current), session));
        if same {
            sessions.remove(&id);
            tracing::info!("Evicted session {}", id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Concatenated diagnostics of every session, `None` while there are none
    pub async fn stats(&self) -> Option<String> {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return None;
        }

        let mut report = String::new();
        for session in sessions {
            report.push_str(&session.stats().await);
        }
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::testing::MockTransport;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_session() {
        let registry = SessionRegistry::new(6);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(77) })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(registry.len(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[tokio::test]
    async fn test_last_transport_leaving_evicts_session() {
        let registry = SessionRegistry::new(6);
        let session = registry.get_or_create(5);
        session.add_transport(MockTransport::new("t")).await.unwrap();
        assert!(registry.get(5).is_some());

        session.remove_transport("t").await;

        assert!(registry.get(5).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let registry = SessionRegistry::new(6);
        let first = registry.get_or_create(3);
        first.add_transport(MockTransport::new("t")).await.unwrap();
        first.remove_transport("t").await;

        let second = registry.get_or_create(3);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());

        // A stale eviction for the first session must not remove the second
        registry.evict(3, &Arc::downgrade(&first));
        assert!(registry.get(3).is_some_and(|s| Arc::ptr_eq(&s, &second)));
    }

    #[tokio::test]
    async fn test_empty_session_closed_before_join_is_evicted() {
        let registry = SessionRegistry::new(6);
        let session = registry.get_or_create(42);
        assert!(session.close_if_empty().await);

        assert!(registry.get(42).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_join_retries_when_session_closes_first() {
        let registry = SessionRegistry::new(6);
        let mut seen: Vec<Arc<Session>> = Vec::new();

        let joined = registry
            .join(11, |session| {
                seen.push(session.clone());
                let first = seen.len() == 1;
                async move {
                    if first {
                        // The last transport leaves before this one is added
                        session.add_transport(MockTransport::new("leaving")).await?;
                        session.remove_transport("leaving").await;
                    }
                    session.add_transport(MockTransport::new("joining")).await?;
                    Ok(session)
                }
            })
            .await
            .unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_closed());
        assert!(Arc::ptr_eq(&joined, &seen[1]));
        assert!(registry.get(11).is_some_and(|s| Arc::ptr_eq(&s, &joined)));
        assert!(joined.transport("joining").await.is_some());
    }

    #[tokio::test]
    async fn test_join_passes_other_errors_through() {
        let registry = SessionRegistry::new(6);
        let mut calls = 0;

        let result: Result<()> = registry
            .join(12, |_session| {
                calls += 1;
                async { Err(SfuError::SessionClosed(99)) }
            })
            .await;

        assert!(matches!(result, Err(SfuError::SessionClosed(99))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_stats_empty_registry() {
        let registry = SessionRegistry::new(6);
        assert!(registry.stats().await.is_none());

        registry.get_or_create(1);
        let report = registry.stats().await.unwrap();
        assert!(report.contains("session: 1"));
    }
}
