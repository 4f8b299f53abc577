//! Local socket registry.
//!
//! Per-instance map of connection id → connection context, with a secondary
//! index by user id. Never shared with other instances. Removing an entry is
//! the single point where a connection stops existing: whoever gets the
//! entry back from [`LocalRegistry::remove`] or [`LocalRegistry::drain_all`]
//! owns its cleanup.

use roomcast_core::{ConnectionId, InstanceId, RoomId, ServerEvent, UserId};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Why the server is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Instance is draining.
    Shutdown,
}

/// Items queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close(CloseReason),
}

/// Strongly-typed connection context, fixed at handshake.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub instance_id: InstanceId,
    pub rooms: HashSet<RoomId>,
    pub created_at: Instant,
    pub last_heartbeat: Instant,
    /// Presence epoch in which this connection was last counted into the
    /// fleet-wide total; `0` if it never was.
    pub presence_epoch: u64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionEntry {
    /// Queue an event without waiting. A full queue drops the event for this
    /// connection only.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(Outbound::Event(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "outbound queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection's writer to close.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.try_send(Outbound::Close(reason));
    }

    /// Events queued but not yet written to the socket.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Registry of this instance's live connections.
pub struct LocalRegistry {
    instance_id: InstanceId,
    queue_capacity: usize,
    state: RwLock<RegistryState>,
}

impl LocalRegistry {
    pub fn new(instance_id: InstanceId, queue_capacity: usize) -> Self {
        Self {
            instance_id,
            queue_capacity,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Admit an authenticated connection. Returns its id and the receiving
    /// half of its outbound queue.
    pub async fn register(&self, user_id: UserId) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = ConnectionId::generate();
        let now = Instant::now();
        let entry = ConnectionEntry {
            id: id.clone(),
            user_id: user_id.clone(),
            instance_id: self.instance_id.clone(),
            rooms: HashSet::new(),
            created_at: now,
            last_heartbeat: now,
            presence_epoch: 0,
            tx,
        };

        let mut state = self.state.write().await;
        state
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(id.clone());
        state.connections.insert(id.clone(), entry);
        info!(conn_id = %id, user_id = %user_id, total = state.connections.len(), "connection registered");

        (id, rx)
    }

    /// Remove a connection. `None` if it was already gone.
    pub async fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(id)?;
        if let Some(conns) = state.by_user.get_mut(&entry.user_id) {
            conns.remove(id);
            if conns.is_empty() {
                state.by_user.remove(&entry.user_id);
            }
        }
        debug!(conn_id = %id, user_id = %entry.user_id, "connection unregistered");
        Some(entry)
    }

    /// Remove every connection (drain).
    pub async fn drain_all(&self) -> Vec<ConnectionEntry> {
        let mut state = self.state.write().await;
        state.by_user.clear();
        state.connections.drain().map(|(_, e)| e).collect()
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.state.read().await.connections.get(id).cloned()
    }

    pub async fn user_of(&self, id: &ConnectionId) -> Option<UserId> {
        self.state
            .read()
            .await
            .connections
            .get(id)
            .map(|e| e.user_id.clone())
    }

    /// All local connections held by `user`.
    pub async fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .by_user
            .get(user)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Refresh a connection's heartbeat timestamp.
    pub async fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.state.write().await.connections.get_mut(id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Record a room on the connection. `false` if the connection is gone.
    pub async fn add_room(&self, id: &ConnectionId, room: &RoomId) -> bool {
        match self.state.write().await.connections.get_mut(id) {
            Some(entry) => {
                entry.rooms.insert(room.clone());
                true
            }
            None => false,
        }
    }

    /// Drop a room from the connection. `true` if it was joined.
    pub async fn remove_room(&self, id: &ConnectionId, room: &RoomId) -> bool {
        self.state
            .write()
            .await
            .connections
            .get_mut(id)
            .map(|entry| entry.rooms.remove(room))
            .unwrap_or(false)
    }

    /// Record that the presence total includes this connection as of
    /// `epoch`. `false` if the connection is gone.
    pub async fn mark_counted(&self, id: &ConnectionId, epoch: u64) -> bool {
        match self.state.write().await.connections.get_mut(id) {
            Some(entry) => {
                entry.presence_epoch = epoch;
                true
            }
            None => false,
        }
    }

    /// Every live connection with its user.
    pub async fn presence_snapshot(&self) -> Vec<(ConnectionId, UserId)> {
        self.state
            .read()
            .await
            .connections
            .values()
            .map(|e| (e.id.clone(), e.user_id.clone()))
            .collect()
    }

    /// Queue `event` for every id in `ids` that passes `filter`.
    /// Returns how many connections accepted it.
    pub async fn send_to<F>(&self, ids: &[ConnectionId], event: &ServerEvent, filter: F) -> usize
    where
        F: Fn(&ConnectionEntry) -> bool,
    {
        let state = self.state.read().await;
        ids.iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|entry| filter(*entry))
            .filter(|entry| entry.send(event.clone()))
            .count()
    }

    /// Queue `event` for every local connection.
    pub async fn broadcast(&self, event: &ServerEvent) -> usize {
        let state = self.state.read().await;
        state
            .connections
            .values()
            .filter(|entry| entry.send(event.clone()))
            .count()
    }

    /// Events queued across all connections.
    pub async fn pending_outbound(&self) -> usize {
        self.state
            .read()
            .await
            .connections
            .values()
            .map(ConnectionEntry::queued)
            .sum()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }
}
