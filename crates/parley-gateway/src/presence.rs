use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// Tracks which users currently hold a live connection and owns the
/// per-user targeted send channels. Constructed once at server start;
/// independent instances can be built for tests.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    /// Broadcast channel for connection-scoped events every client receives
    /// (currently only the online-users set).
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// user_id -> (conn_id, sender). At most one entry per user — a new
    /// connection for an already-registered user replaces the prior one.
    channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Presence {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(PresenceInner {
                broadcast_tx,
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to presence broadcasts. A connection subscribes before
    /// registering so it receives the broadcast announcing itself.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Register a connection for a user, unconditionally replacing any
    /// existing one (last socket wins), then broadcast the updated
    /// online-users set to every connection. Returns the connection id and
    /// the targeted event receiver for this connection.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        self.broadcast_online().await;
        (conn_id, rx)
    }

    /// Remove a user's mapping, but only if `conn_id` still owns it. A stale
    /// disconnect arriving after a reconnection must not evict the newer
    /// connection. Re-broadcasts presence when something was removed.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        let removed = {
            let mut channels = self.inner.channels.write().await;
            match channels.get(&user_id) {
                Some((stored_conn_id, _)) if *stored_conn_id == conn_id => {
                    channels.remove(&user_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.broadcast_online().await;
        }
    }

    /// Push a targeted event to a user's live connection. Returns whether a
    /// connection was present — absence is a normal routed-drop, not an
    /// error.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let channels = self.inner.channels.read().await;
        match channels.get(&user_id) {
            Some((_, tx)) => {
                let _ = tx.send(event);
                true
            }
            None => false,
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.channels.read().await.contains_key(&user_id)
    }

    pub async fn online_user_ids(&self) -> Vec<Uuid> {
        self.inner.channels.read().await.keys().copied().collect()
    }

    async fn broadcast_online(&self) {
        let user_ids = self.online_user_ids().await;
        let _ = self
            .inner
            .broadcast_tx
            .send(GatewayEvent::OnlineUsers { user_ids });
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
