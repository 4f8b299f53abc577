//! Typing indicators.
//!
//! Each (connection, room) pair with an active indicator owns one timer.
//! `typing(true)` arms or re-arms it, `typing(false)` cancels it, and expiry
//! publishes `isTyping=false` on the user's behalf.

use super::Broadcaster;
use roomcast_core::{BroadcastEvent, ConnectionId, RoomId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

type Key = (ConnectionId, RoomId);

struct Timer {
    user: UserId,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    next_generation: u64,
    timers: HashMap<Key, Timer>,
}

pub struct TypingTracker {
    broadcaster: Arc<Broadcaster>,
    timeout: Duration,
    state: Arc<Mutex<TypingState>>,
}

impl TypingTracker {
    pub fn new(broadcaster: Arc<Broadcaster>, timeout: Duration) -> Self {
        Self {
            broadcaster,
            timeout,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    pub async fn update(&self, conn: &ConnectionId, user: &UserId, room: &RoomId, is_typing: bool) {
        if is_typing {
            self.start(conn, user, room).await;
        } else {
            self.stop(conn, room).await;
        }
    }

    async fn start(&self, conn: &ConnectionId, user: &UserId, room: &RoomId) {
        let key = (conn.clone(), room.clone());
        let active = lock(&self.state).timers.contains_key(&key);
        if !active {
            publish(&self.broadcaster, conn, user, room, true).await;
        }
        self.arm(key, user.clone());
    }

    fn arm(&self, key: Key, user: UserId) {
        let mut state = lock(&self.state);
        state.next_generation += 1;
        let generation = state.next_generation;
        let handle = tokio::spawn(expire(
            Arc::clone(&self.state),
            Arc::clone(&self.broadcaster),
            key.clone(),
            generation,
            self.timeout,
        ));
        let previous = state.timers.insert(
            key,
            Timer {
                user,
                generation,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Cancel one indicator. Publishes `false` if it was active.
    pub async fn stop(&self, conn: &ConnectionId, room: &RoomId) {
        let removed = lock(&self.state).timers.remove(&(conn.clone(), room.clone()));
        if let Some(timer) = removed {
            timer.handle.abort();
            publish(&self.broadcaster, conn, &timer.user, room, false).await;
        }
    }

    /// Cancel every indicator of a departing connection.
    pub async fn cancel_connection(&self, conn: &ConnectionId) {
        let removed: Vec<(RoomId, Timer)> = {
            let mut state = lock(&self.state);
            let keys: Vec<Key> = state
                .timers
                .keys()
                .filter(|(c, _)| c == conn)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| state.timers.remove(&key).map(|t| (key.1, t)))
                .collect()
        };
        for (room, timer) in removed {
            timer.handle.abort();
            publish(&self.broadcaster, conn, &timer.user, &room, false).await;
        }
    }

    /// Number of armed timers.
    pub fn active(&self) -> usize {
        lock(&self.state).timers.len()
    }
}

async fn expire(
    state: Arc<Mutex<TypingState>>,
    broadcaster: Arc<Broadcaster>,
    key: Key,
    generation: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;
    let expired = {
        let mut state = lock(&state);
        match state.timers.get(&key) {
            Some(timer) if timer.generation == generation => state.timers.remove(&key),
            _ => None,
        }
    };
    if let Some(timer) = expired {
        let (conn, room) = key;
        debug!(conn_id = %conn, room_id = %room, "typing indicator expired");
        publish(&broadcaster, &conn, &timer.user, &room, false).await;
    }
}

async fn publish(
    broadcaster: &Broadcaster,
    conn: &ConnectionId,
    user: &UserId,
    room: &RoomId,
    is_typing: bool,
) {
    broadcaster
        .publish(
            Some(conn.clone()),
            BroadcastEvent::TypingSignal {
                room_id: room.clone(),
                user_id: user.clone(),
                is_typing,
            },
        )
        .await;
}

fn lock(state: &Mutex<TypingState>) -> MutexGuard<'_, TypingState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{FabricInbound, MemoryHub};
    use crate::fanout::LocalFanout;
    use crate::registry::LocalRegistry;
    use crate::rooms::{OpenMembership, RoomMembership};
    use tokio::sync::mpsc;

    fn tracker(timeout_ms: u64) -> (TypingTracker, mpsc::Receiver<FabricInbound>) {
        let hub = MemoryHub::new();
        let (fabric, inbound) = hub.attach("i1".into());
        let registry = Arc::new(LocalRegistry::new("i1".into(), 16));
        let rooms = Arc::new(RoomMembership::new(
            registry.clone(),
            Arc::new(OpenMembership),
            Duration::from_secs(1),
        ));
        let fanout = Arc::new(LocalFanout::new(registry, rooms));
        let broadcaster = Arc::new(Broadcaster::new("i1".into(), Arc::new(fabric), fanout));
        (
            TypingTracker::new(broadcaster, Duration::from_millis(timeout_ms)),
            inbound,
        )
    }

    async fn next_typing(rx: &mut mpsc::Receiver<FabricInbound>) -> bool {
        match rx.recv().await {
            Some(FabricInbound::Event(env)) => match env.event {
                BroadcastEvent::TypingSignal { is_typing, .. } => is_typing,
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn indicator_expires_without_follow_up() {
        let (tracker, mut rx) = tracker(50);
        let (conn, user, room) = ("c1".into(), "alice".into(), "R1".into());

        tracker.update(&conn, &user, &room, true).await;
        assert!(next_typing(&mut rx).await);
        assert_eq!(tracker.active(), 1);

        let expired = tokio::time::timeout(Duration::from_secs(2), next_typing(&mut rx))
            .await
            .unwrap();
        assert!(!expired);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn refresh_rearms_without_republishing() {
        let (tracker, mut rx) = tracker(150);
        let (conn, user, room) = ("c1".into(), "alice".into(), "R1".into());

        tracker.update(&conn, &user, &room, true).await;
        assert!(next_typing(&mut rx).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracker.update(&conn, &user, &room, true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // the first timer would have fired by now
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.active(), 1);

        assert!(!next_typing(&mut rx).await);
    }

    #[tokio::test]
    async fn explicit_stop_publishes_once() {
        let (tracker, mut rx) = tracker(1000);
        let (conn, user, room) = ("c1".into(), "alice".into(), "R1".into());

        tracker.update(&conn, &user, &room, true).await;
        assert!(next_typing(&mut rx).await);
        tracker.update(&conn, &user, &room, false).await;
        assert!(!next_typing(&mut rx).await);
        tracker.update(&conn, &user, &room, false).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn disconnect_clears_every_room() {
        let (tracker, mut rx) = tracker(1000);
        let conn: ConnectionId = "c1".into();
        let user: UserId = "alice".into();
        tracker.update(&conn, &user, &"R1".into(), true).await;
        tracker.update(&conn, &user, &"R2".into(), true).await;
        tracker.update(&"c2".into(), &"bob".into(), &"R1".into(), true).await;
        for _ in 0..3 {
            assert!(next_typing(&mut rx).await);
        }

        tracker.cancel_connection(&conn).await;
        assert!(!next_typing(&mut rx).await);
        assert!(!next_typing(&mut rx).await);
        assert_eq!(tracker.active(), 1);
    }
}
