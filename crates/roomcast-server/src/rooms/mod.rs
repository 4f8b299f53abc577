//! Room membership manager.
//!
//! Tracks which local connections are subscribed to which rooms. A
//! subscription exists only after the external store has confirmed the
//! user's right to the room.
//!
//! Lock order: the room index may be held while the registry is locked,
//! never the other way round.

pub mod membership;

pub use membership::{MembershipStore, OpenMembership, StaticMembership};

use crate::registry::LocalRegistry;
use roomcast_core::{ConnectionId, RoomId, RoomcastError, RoomcastResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Local room subscriptions for this instance.
pub struct RoomMembership {
    registry: Arc<LocalRegistry>,
    store: Arc<dyn MembershipStore>,
    lookup_timeout: Duration,
    subscribers: RwLock<HashMap<RoomId, HashSet<ConnectionId>>>,
}

impl RoomMembership {
    pub fn new(
        registry: Arc<LocalRegistry>,
        store: Arc<dyn MembershipStore>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            lookup_timeout,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe `conn` to `room` after checking the external store.
    ///
    /// Returns `true` for a new subscription, `false` if already joined.
    pub async fn join(&self, conn: &ConnectionId, room: &RoomId) -> RoomcastResult<bool> {
        if room.is_empty() {
            return Err(RoomcastError::InvalidEvent("empty room id".into()));
        }
        let user = self
            .registry
            .user_of(conn)
            .await
            .ok_or_else(|| RoomcastError::Other(format!("unknown connection {conn}")))?;

        if self.is_subscribed(conn, room).await {
            return Ok(false);
        }

        let allowed = tokio::time::timeout(self.lookup_timeout, self.store.is_member(room, &user))
            .await
            .map_err(|_| RoomcastError::Timeout)??;
        if !allowed {
            warn!(conn_id = %conn, user_id = %user, room_id = %room, "join denied by membership store");
            return Err(RoomcastError::Membership(format!(
                "{user} is not a member of {room}"
            )));
        }

        let mut subscribers = self.subscribers.write().await;
        // The connection may have gone away during the lookup.
        if !self.registry.add_room(conn, room).await {
            return Err(RoomcastError::Other(format!("connection {conn} closed")));
        }
        let added = subscribers
            .entry(room.clone())
            .or_default()
            .insert(conn.clone());
        info!(conn_id = %conn, user_id = %user, room_id = %room, "joined room");
        Ok(added)
    }

    /// Unsubscribe `conn` from `room`. `true` if it was subscribed.
    pub async fn leave(&self, conn: &ConnectionId, room: &RoomId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        self.registry.remove_room(conn, room).await;
        let removed = remove_from(&mut subscribers, room, conn);
        if removed {
            debug!(conn_id = %conn, room_id = %room, "left room");
        }
        removed
    }

    /// Drop every subscription of a connection that has left the registry.
    pub async fn remove_connection(&self, conn: &ConnectionId, rooms: &HashSet<RoomId>) {
        let mut subscribers = self.subscribers.write().await;
        for room in rooms {
            remove_from(&mut subscribers, room, conn);
        }
    }

    pub async fn is_subscribed(&self, conn: &ConnectionId, room: &RoomId) -> bool {
        self.subscribers
            .read()
            .await
            .get(room)
            .map(|s| s.contains(conn))
            .unwrap_or(false)
    }

    /// Local connections subscribed to `room`.
    pub async fn subscribers(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.subscribers
            .read()
            .await
            .get(room)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one local subscriber.
    pub async fn room_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

fn remove_from(
    subscribers: &mut HashMap<RoomId, HashSet<ConnectionId>>,
    room: &RoomId,
    conn: &ConnectionId,
) -> bool {
    let Some(set) = subscribers.get_mut(room) else {
        return false;
    };
    let removed = set.remove(conn);
    if set.is_empty() {
        subscribers.remove(room);
    }
    removed
}
