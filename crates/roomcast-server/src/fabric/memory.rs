//! In-process fabric.
//!
//! A [`MemoryHub`] plays the broker: every attached instance gets a
//! [`MemoryFabric`] handle and an inbound receiver. Envelopes go through the
//! JSON codec so they take the same path a broker round-trip would.
//! [`MemoryFabric::sever`] and [`MemoryFabric::restore`] simulate losing and
//! regaining the broker; liveness is "attached and not killed".

use super::{unavailable, Fabric, FabricFuture, FabricInbound, FabricStatus, INBOUND_CAPACITY};
use roomcast_core::{codec, FabricEnvelope, InstanceId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Link {
    tx: mpsc::Sender<FabricInbound>,
    up: bool,
    subscribed: bool,
}

#[derive(Default)]
struct HubState {
    links: HashMap<InstanceId, Link>,
    /// user → instance → share
    shares: HashMap<UserId, HashMap<InstanceId, i64>>,
    /// Instances whose liveness record is current.
    alive: HashSet<InstanceId>,
}

impl HubState {
    fn total(&self, user: &UserId) -> i64 {
        self.shares
            .get(user)
            .map(|s| s.values().sum())
            .unwrap_or(0)
    }

    fn set_share(&mut self, user: &UserId, instance: &InstanceId, share: i64) {
        if share > 0 {
            self.shares
                .entry(user.clone())
                .or_default()
                .insert(instance.clone(), share);
        } else if let Some(s) = self.shares.get_mut(user) {
            s.remove(instance);
            if s.is_empty() {
                self.shares.remove(user);
            }
        }
    }

    fn share(&self, user: &UserId, instance: &InstanceId) -> i64 {
        self.shares
            .get(user)
            .and_then(|s| s.get(instance))
            .copied()
            .unwrap_or(0)
    }
}

/// Shared broker for a set of in-process instances.
#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect an instance. Replaces any previous link with the same id.
    pub fn attach(self: &Arc<Self>, instance: InstanceId) -> (MemoryFabric, mpsc::Receiver<FabricInbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut state = self.lock();
        state.links.insert(
            instance.clone(),
            Link {
                tx,
                up: true,
                subscribed: true,
            },
        );
        state.alive.insert(instance.clone());
        drop(state);
        debug!(instance_id = %instance, "attached to memory fabric");
        (
            MemoryFabric {
                hub: Arc::clone(self),
                instance,
            },
            rx,
        )
    }

    /// Fleet-wide count for `user`.
    pub fn counter(&self, user: &UserId) -> i64 {
        self.lock().total(user)
    }

    /// The instance dies without draining: its link and liveness record go,
    /// its shares stay behind.
    #[cfg(test)]
    pub fn kill(&self, instance: &InstanceId) {
        let mut state = self.lock();
        state.links.remove(instance);
        state.alive.remove(instance);
    }

    /// The broker restarts with an empty keyspace.
    #[cfg(test)]
    pub fn lose_state(&self) {
        let mut state = self.lock();
        state.shares.clear();
        state.alive.clear();
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One instance's handle on a [`MemoryHub`].
pub struct MemoryFabric {
    hub: Arc<MemoryHub>,
    instance: InstanceId,
}

impl MemoryFabric {
    /// Simulate a broker outage for this instance.
    pub fn sever(&self) {
        self.set_up(false);
    }

    /// End the simulated outage.
    pub fn restore(&self) {
        self.set_up(true);
    }

    fn set_up(&self, up: bool) {
        let mut state = self.hub.lock();
        if let Some(link) = state.links.get_mut(&self.instance) {
            if link.up == up {
                return;
            }
            link.up = up;
            let status = if up { FabricStatus::Up } else { FabricStatus::Down };
            let _ = link.tx.try_send(FabricInbound::Status(status));
        }
    }

    /// Run `f` against the hub state if this instance's link is up.
    fn with_link<T>(&self, f: impl FnOnce(&mut HubState) -> T) -> Result<T, roomcast_core::RoomcastError> {
        let mut state = self.hub.lock();
        match state.links.get(&self.instance) {
            Some(link) if link.up => Ok(f(&mut state)),
            Some(_) => Err(unavailable("memory fabric link is down")),
            None => Err(unavailable("memory fabric closed")),
        }
    }
}

impl Fabric for MemoryFabric {
    fn publish<'a>(&'a self, envelope: &'a FabricEnvelope) -> FabricFuture<'a, ()> {
        Box::pin(async move {
            let payload = codec::encode(envelope)?;
            self.with_link(|state| {
                for (instance, link) in &state.links {
                    if !(link.up && link.subscribed) {
                        continue;
                    }
                    let decoded = match codec::decode::<FabricEnvelope>(&payload) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable envelope");
                            return;
                        }
                    };
                    if link.tx.try_send(FabricInbound::Event(decoded)).is_err() {
                        warn!(instance_id = %instance, "inbound queue full, event lost");
                    }
                }
            })
        })
    }

    fn increment_presence<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64> {
        Box::pin(async move {
            self.with_link(|state| {
                let share = state.share(user, &self.instance) + 1;
                state.set_share(user, &self.instance, share);
                state.total(user)
            })
        })
    }

    fn decrement_presence<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64> {
        Box::pin(async move {
            self.with_link(|state| {
                let share = state.share(user, &self.instance);
                if share <= 0 {
                    return -1;
                }
                state.set_share(user, &self.instance, share - 1);
                state.total(user)
            })
        })
    }

    fn presence_count<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64> {
        Box::pin(async move { self.with_link(|state| state.total(user)) })
    }

    fn set_presence_share<'a>(&'a self, user: &'a UserId, share: i64) -> FabricFuture<'a, (i64, i64)> {
        Box::pin(async move {
            self.with_link(|state| {
                let before = state.total(user);
                state.set_share(user, &self.instance, share);
                (before, state.total(user))
            })
        })
    }

    fn presence_shares(&self) -> FabricFuture<'_, Vec<UserId>> {
        Box::pin(async move {
            self.with_link(|state| {
                state
                    .shares
                    .iter()
                    .filter(|(_, s)| s.get(&self.instance).copied().unwrap_or(0) > 0)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
        })
    }

    fn keep_alive(&self) -> FabricFuture<'_, bool> {
        Box::pin(async move { self.with_link(|state| !state.alive.insert(self.instance.clone())) })
    }

    fn sweep_dead(&self) -> FabricFuture<'_, Vec<UserId>> {
        Box::pin(async move {
            self.with_link(|state| {
                let mut offline = Vec::new();
                let alive = state.alive.clone();
                state.shares.retain(|user, shares| {
                    let dropped: i64 = shares
                        .iter()
                        .filter(|(instance, _)| !alive.contains(*instance))
                        .map(|(_, share)| *share)
                        .sum();
                    shares.retain(|instance, _| alive.contains(instance));
                    if dropped > 0 && shares.is_empty() {
                        offline.push(user.clone());
                    }
                    !shares.is_empty()
                });
                if !offline.is_empty() {
                    info!(users = offline.len(), "swept presence of dead instances");
                }
                offline.sort();
                offline
            })
        })
    }

    fn unsubscribe(&self) -> FabricFuture<'_, ()> {
        Box::pin(async move {
            if let Some(link) = self.hub.lock().links.get_mut(&self.instance) {
                link.subscribed = false;
            }
            Ok(())
        })
    }

    fn close(&self) -> FabricFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.hub.lock();
            state.links.remove(&self.instance);
            state.alive.remove(&self.instance);
            debug!(instance_id = %self.instance, "detached from memory fabric");
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.hub
            .lock()
            .links
            .get(&self.instance)
            .map(|link| link.up)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::{BroadcastEvent, RoomcastError};

    fn presence(user: &str, online: bool) -> FabricEnvelope {
        FabricEnvelope {
            origin_instance: "i1".into(),
            origin_connection: None,
            event: BroadcastEvent::PresenceChange {
                user_id: user.into(),
                online,
            },
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_including_origin() {
        let hub = MemoryHub::new();
        let (a, mut rx_a) = hub.attach("i1".into());
        let (_b, mut rx_b) = hub.attach("i2".into());

        let env = presence("alice", true);
        a.publish(&env).await.unwrap();
        assert_eq!(rx_a.recv().await, Some(FabricInbound::Event(env.clone())));
        assert_eq!(rx_b.recv().await, Some(FabricInbound::Event(env)));
    }

    #[tokio::test]
    async fn counter_floors_at_zero() {
        let hub = MemoryHub::new();
        let (a, _rx) = hub.attach("i1".into());
        let alice = UserId::from("alice");

        assert_eq!(a.increment_presence(&alice).await.unwrap(), 1);
        assert_eq!(a.increment_presence(&alice).await.unwrap(), 2);
        assert_eq!(a.decrement_presence(&alice).await.unwrap(), 1);
        assert_eq!(a.decrement_presence(&alice).await.unwrap(), 0);
        assert_eq!(a.decrement_presence(&alice).await.unwrap(), -1);
        assert_eq!(hub.counter(&alice), 0);
    }

    #[tokio::test]
    async fn each_instance_moves_only_its_own_share() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.attach("i1".into());
        let (b, _rx_b) = hub.attach("i2".into());
        let alice = UserId::from("alice");

        assert_eq!(a.increment_presence(&alice).await.unwrap(), 1);
        assert_eq!(b.increment_presence(&alice).await.unwrap(), 2);
        // i2 cannot spend i1's share
        assert_eq!(b.decrement_presence(&alice).await.unwrap(), 1);
        assert_eq!(b.decrement_presence(&alice).await.unwrap(), -1);
        assert_eq!(a.presence_count(&alice).await.unwrap(), 1);
        assert_eq!(a.presence_shares().await.unwrap(), vec![alice.clone()]);
        assert!(b.presence_shares().await.unwrap().is_empty());

        assert_eq!(b.set_presence_share(&alice, 3).await.unwrap(), (1, 4));
        assert_eq!(b.set_presence_share(&alice, 0).await.unwrap(), (4, 1));
    }

    #[tokio::test]
    async fn sweep_drops_shares_of_killed_instances() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.attach("i1".into());
        let (b, _rx_b) = hub.attach("i2".into());
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        a.increment_presence(&alice).await.unwrap();
        a.increment_presence(&bob).await.unwrap();
        b.increment_presence(&bob).await.unwrap();

        // nothing to sweep while everyone is alive
        assert!(b.sweep_dead().await.unwrap().is_empty());

        hub.kill(&"i1".into());
        assert_eq!(b.sweep_dead().await.unwrap(), vec![alice.clone()]);
        assert_eq!(hub.counter(&alice), 0);
        assert_eq!(hub.counter(&bob), 1);
        // a second sweep finds nothing left
        assert!(b.sweep_dead().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_reports_a_lapsed_record() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.attach("i1".into());
        assert!(a.keep_alive().await.unwrap());
        hub.lose_state();
        assert!(!a.keep_alive().await.unwrap());
        assert!(a.keep_alive().await.unwrap());
    }

    #[tokio::test]
    async fn severed_link_fails_and_reports_status() {
        let hub = MemoryHub::new();
        let (a, mut rx_a) = hub.attach("i1".into());
        let (b, mut rx_b) = hub.attach("i2".into());

        a.sever();
        assert!(!a.is_connected());
        assert_eq!(rx_a.recv().await, Some(FabricInbound::Status(FabricStatus::Down)));
        let err = a.publish(&presence("alice", true)).await.unwrap_err();
        assert!(matches!(err, RoomcastError::FabricUnavailable(_)));
        assert!(a.increment_presence(&"alice".into()).await.is_err());

        // the severed instance misses traffic from others
        b.publish(&presence("bob", true)).await.unwrap();
        assert!(matches!(rx_b.recv().await, Some(FabricInbound::Event(_))));
        assert!(rx_a.try_recv().is_err());

        a.restore();
        assert_eq!(rx_a.recv().await, Some(FabricInbound::Status(FabricStatus::Up)));
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn unsubscribed_instance_still_publishes() {
        let hub = MemoryHub::new();
        let (a, mut rx_a) = hub.attach("i1".into());
        let (_b, mut rx_b) = hub.attach("i2".into());

        a.unsubscribe().await.unwrap();
        a.publish(&presence("alice", false)).await.unwrap();
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }
}
