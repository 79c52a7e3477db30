//! Session: the transports of one conference and the routers they publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::router::Router;
use super::transport::Transport;
use crate::error::{Result, SfuError};

type CloseCallback = Box<dyn FnOnce() + Send + Sync>;

pub struct Session {
    id: u32,
    /// Transport ID -> transport
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    /// SSRC -> router
    routers: RwLock<HashMap<u32, Arc<Router>>>,
    on_close: parking_lot::Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
    max_listed_subscribers: usize,
}

impl Session {
    pub fn new(id: u32) -> Arc<Self> {
        Self::with_stats_threshold(id, 6)
    }

    pub fn with_stats_threshold(id: u32, max_listed_subscribers: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            transports: RwLock::new(HashMap::new()),
            routers: RwLock::new(HashMap::new()),
            on_close: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            max_listed_subscribers,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once the last transport has left
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register the callback fired when the last transport leaves. Fires
    /// right away when the session is already closed.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let mut slot = self.on_close.lock();
        if self.is_closed() {
            drop(slot);
            callback();
            return;
        }
        *slot = Some(Box::new(callback));
    }

    fn fire_close(&self) {
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Join `transport` to the session and subscribe it to every stream
    /// already published by someone else
    pub async fn add_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut transports = self.transports.write().await;
            if self.is_closed() {
                return Err(SfuError::SessionClosed(self.id));
            }
            transports.insert(transport.id().to_string(), transport.clone());
        }

        tracing::info!("Transport {} joined session {}", transport.id(), self.id);

        for router in self.routers().await {
            if router.publisher_id() == transport.id() {
                continue;
            }
            if let Err(e) = transport.subscribe(router.clone(), false).await {
                tracing::warn!(
                    "Failed to subscribe transport {} to router {} in session {}: {}",
                    transport.id(),
                    router.ssrc(),
                    self.id,
                    e
                );
            }
        }

        Ok(())
    }

    /// Publish a new stream into the session. Every transport other than the
    /// publisher is subscribed and asked to renegotiate.
    pub async fn add_router(self: &Arc<Self>, router: Arc<Router>) {
        let replaced = self
            .routers
            .write()
            .await
            .insert(router.ssrc(), router.clone());

        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, &router) {
                tracing::info!("Replacing router {} in session {}", old.ssrc(), self.id);
                old.close().await;
            }
        }

        tracing::info!(
            "Router {} added to session {} by {}",
            router.ssrc(),
            self.id,
            router.publisher_id()
        );

        let session = Arc::downgrade(self);
        let watched = router.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(session) = session.upgrade() {
                session.remove_router(&watched).await;
            }
        });

        let subscribers: Vec<Arc<dyn Transport>> = self
            .transports
            .read()
            .await
            .values()
            .filter(|t| t.id() != router.publisher_id())
            .cloned()
            .collect();

        for transport in subscribers {
            if let Err(e) = transport.subscribe(router.clone(), true).await {
                tracing::warn!(
                    "Failed to subscribe transport {} to new router {} in session {}: {}",
                    transport.id(),
                    router.ssrc(),
                    self.id,
                    e
                );
            }
        }
    }

    async fn remove_router(&self, router: &Arc<Router>) {
        let mut routers = self.routers.write().await;
        let same = routers
            .get(&router.ssrc())
            .is_some_and(|current| Arc::ptr_eq(current, router));
        if same {
            routers.remove(&router.ssrc());
            tracing::info!("Router {} removed from session {}", router.ssrc(), self.id);
        }
    }

    /// Unregister a transport and drop its subscriptions. Closes the session
    /// when it was the last one.
    pub async fn remove_transport(&self, id: &str) -> bool {
        let (removed, now_empty) = {
            let mut transports = self.transports.write().await;
            let removed = transports.remove(id).is_some();
            let now_empty = removed && transports.is_empty();
            if now_empty {
                self.closed.store(true, Ordering::SeqCst);
            }
            (removed, now_empty)
        };

        if !removed {
            return false;
        }

        for router in self.routers().await {
            router.remove_sub(id).await;
        }

        tracing::info!("Transport {} left session {}", id, self.id);

        if now_empty {
            tracing::info!("Session {} closed", self.id);
            self.fire_close();
        }

        true
    }

    /// Close a session nobody has joined yet. Returns false when a
    /// transport is present or the session is already closed.
    pub async fn close_if_empty(&self) -> bool {
        {
            let transports = self.transports.write().await;
            if !transports.is_empty() || self.is_closed() {
                return false;
            }
            self.closed.store(true, Ordering::SeqCst);
        }

        tracing::info!("Session {} closed before anyone joined", self.id);
        self.fire_close();
        true
    }

    pub async fn router(&self, ssrc: u32) -> Option<Arc<Router>> {
        self.routers.read().await.get(&ssrc).cloned()
    }

    pub async fn routers(&self) -> Vec<Arc<Router>> {
        self.routers.read().await.values().cloned().collect()
    }

    pub async fn transport(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().await.get(id).cloned()
    }

    pub async fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> String {
        let mut routers = self.routers().await;
        routers.sort_by_key(|router| router.ssrc());
        let transports = self.transports().await;

        let mut info = format!(
            "  session: {} | transports: {} routers: {}\n",
            self.id,
            transports.len(),
            routers.len()
        );
        for router in routers {
            info.push_str(&router.stats(self.max_listed_subscribers).await);
        }
        for transport in transports {
            info.push_str(&transport.stats().await);
        }

        info
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
