//! Registry of live connections
//!
//! Connections are indexed twice: by connection id for broadcast-to-all and
//! by owning user for targeted delivery. Both indexes live behind one lock
//! so a connection is always added to and removed from both atomically.
//!
//! The registry holds the only sender of every connection's outbound
//! queue. Removing a connection drops that sender, which ends the
//! connection's write loop and closes the socket.

use crate::{
    error::{GatewayError, GatewayResult},
    model::UserId,
};
use axum::extract::ws::Utf8Bytes;
use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    fmt,
};
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique connection ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry-side handle of a connection
///
/// Not `Clone`: the handle owns the only sender of the outbound queue of
/// encoded event envelopes, and must stay unique.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: Option<UserId>,
    outbound: mpsc::Sender<Utf8Bytes>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its write loop will drain
    pub fn new(user_id: Option<UserId>, buffer: usize) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, rx) = mpsc::channel(buffer);
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }

    /// Queue a frame without waiting; a full or closed queue is a failed write
    pub fn try_deliver(&self, text: Utf8Bytes) -> GatewayResult<()> {
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => {
                GatewayError::Transport("outbound queue is full".to_string())
            }
            TrySendError::Closed(_) => GatewayError::ConnectionClosed,
        })
    }
}

/// Result of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Connections the event was queued for
    pub delivered: usize,
    /// Connections removed because the write failed
    pub pruned: usize,
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub guest_connections: usize,
    pub distinct_users: usize,
}

#[derive(Debug, Default)]
struct Connections {
    all: HashMap<ConnectionId, ConnectionHandle>,
    by_user: HashMap<UserId, Vec<ConnectionId>>,
}

/// Registry of live connections
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Connections>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in both indexes
    pub async fn add(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let user_id = handle.user_id();

        let mut inner = self.inner.write().await;
        inner.all.insert(id, handle);
        if let Some(user_id) = user_id {
            inner.by_user.entry(user_id).or_default().push(id);
        }
        let total = inner.all.len();
        drop(inner);

        debug!(conn_id = %id, user_id = ?user_id, total, "registered connection");
    }

    /// Remove a connection from both indexes and close its socket
    ///
    /// Returns `false` if the connection was already gone; removing twice
    /// is harmless.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(handle) = inner.all.remove(&id) else {
            return false;
        };

        if let Some(user_id) = handle.user_id()
            && let Entry::Occupied(mut bucket) = inner.by_user.entry(user_id)
        {
            bucket.get_mut().retain(|conn_id| *conn_id != id);
            if bucket.get().is_empty() {
                bucket.remove();
            }
        }
        let total = inner.all.len();
        drop(inner);

        // Dropping the handle drops the outbound sender, which ends the write loop.
        drop(handle);
        debug!(conn_id = %id, total, "removed connection");
        true
    }

    /// Queue `text` for every registered connection
    pub async fn broadcast_all(&self, text: Utf8Bytes) -> BroadcastOutcome {
        let attempt = {
            let inner = self.inner.read().await;
            let mut failed = Vec::new();
            for handle in inner.all.values() {
                if let Err(e) = handle.try_deliver(text.clone()) {
                    warn!(conn_id = %handle.id(), error = %e, "broadcast write failed");
                    failed.push(handle.id());
                }
            }
            let delivered = inner.all.len() - failed.len();
            (failed, delivered)
        };

        self.prune(attempt).await
    }

    /// Queue `text` for every connection owned by one of `user_ids`
    pub async fn broadcast_to_users(
        &self,
        user_ids: &[UserId],
        text: Utf8Bytes,
    ) -> BroadcastOutcome {
        let attempt = {
            let inner = self.inner.read().await;
            let mut failed = Vec::new();
            let mut delivered = 0;
            let mut seen = HashSet::with_capacity(user_ids.len());
            for user_id in user_ids {
                if !seen.insert(*user_id) {
                    continue;
                }
                let Some(bucket) = inner.by_user.get(user_id) else {
                    continue;
                };
                for conn_id in bucket {
                    let Some(handle) = inner.all.get(conn_id) else {
                        continue;
                    };
                    match handle.try_deliver(text.clone()) {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            warn!(
                                conn_id = %conn_id,
                                user_id = %user_id,
                                error = %e,
                                "targeted write failed"
                            );
                            failed.push(*conn_id);
                        }
                    }
                }
            }
            (failed, delivered)
        };

        self.prune(attempt).await
    }

    /// Second pass of a broadcast: the read lock is released before any
    /// failing peer is removed under the write lock.
    async fn prune(&self, (failed, delivered): (Vec<ConnectionId>, usize)) -> BroadcastOutcome {
        let mut pruned = 0;
        for id in failed {
            if self.remove(id).await {
                pruned += 1;
            }
        }
        BroadcastOutcome { delivered, pruned }
    }

    /// Remove every connection
    pub async fn close_all(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.all.len();
        inner.all.clear();
        inner.by_user.clear();
        count
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.all.contains_key(&id)
    }

    /// Connections owned by `user_id`, oldest first
    pub async fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.all.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.all.is_empty()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let guest_connections = inner.all.values().filter(|h| h.is_guest()).count();
        RegistryStats {
            total_connections: inner.all.len(),
            authenticated_connections: inner.all.len() - guest_connections,
            guest_connections,
            distinct_users: inner.by_user.len(),
        }
    }

    /// Verify that both indexes agree
    #[doc(hidden)]
    pub async fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.read().await;
        let mut indexed = 0;
        for (user_id, bucket) in &inner.by_user {
            if bucket.is_empty() {
                return Err(format!("empty bucket left behind for user {user_id}"));
            }
            for conn_id in bucket {
                match inner.all.get(conn_id) {
                    Some(handle) if handle.user_id() == Some(*user_id) => indexed += 1,
                    Some(_) => {
                        return Err(format!("{conn_id} filed under wrong user {user_id}"));
                    }
                    None => {
                        return Err(format!("{conn_id} in bucket of {user_id} but not registered"));
                    }
                }
            }
        }
        let authenticated = inner.all.values().filter(|h| !h.is_guest()).count();
        if indexed != authenticated {
            return Err(format!(
                "{authenticated} authenticated connections but {indexed} bucket entries"
            ));
        }
        Ok(())
    }
}
