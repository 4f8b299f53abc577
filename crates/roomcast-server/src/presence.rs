//! Presence coordinator.
//!
//! Online state comes from the fleet-wide count held by the fabric, never
//! from this instance's local view. Only a 0→1 transition publishes
//! `online` and only a 1→0 transition publishes `offline`.
//!
//! The fleet count is a sum of per-instance shares. This instance moves its
//! own share one connection at a time and, whenever that share may have
//! drifted, overwrites it from the registry ([`reconcile`]):
//! - after the fabric comes back up
//! - when the liveness record had lapsed (broker lost its state, or peers
//!   swept this instance)
//! - after any counter operation failed
//!
//! Each reconcile starts a new epoch. A connection is decremented only if
//! it was counted in the current epoch; older counts were already replaced
//! by the reconciled share. A connection that was never counted is never
//! decremented.
//!
//! [`maintain`] also sweeps the shares of instances that died without
//! draining and announces the users that went offline with them.
//!
//! All counter operations of this instance run under one async gate.
//!
//! [`reconcile`]: PresenceCoordinator::reconcile
//! [`maintain`]: PresenceCoordinator::maintain

use crate::fabric::Fabric;
use crate::registry::{ConnectionEntry, LocalRegistry};
use crate::relay::Broadcaster;
use roomcast_core::{BroadcastEvent, ConnectionId, PresenceStatus, RoomcastError, RoomcastResult, UserId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Most users a single `presence.query` may ask about.
pub const MAX_QUERY_USERS: usize = 256;

struct Gate {
    epoch: u64,
}

pub struct PresenceCoordinator {
    fabric: Arc<dyn Fabric>,
    registry: Arc<LocalRegistry>,
    broadcaster: Arc<Broadcaster>,
    gate: tokio::sync::Mutex<Gate>,
    /// A counter operation failed; this instance's share needs re-asserting.
    stale: AtomicBool,
}

impl PresenceCoordinator {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        registry: Arc<LocalRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            fabric,
            registry,
            broadcaster,
            gate: tokio::sync::Mutex::new(Gate { epoch: 1 }),
            stale: AtomicBool::new(false),
        }
    }

    /// Count a newly registered connection.
    pub async fn connected(&self, conn: &ConnectionId, user: &UserId) {
        let gate = self.gate.lock().await;
        match self.registry.get(conn).await {
            Some(entry) if entry.presence_epoch == 0 => {}
            _ => return,
        }
        let count = match self.fabric.increment_presence(user).await {
            Ok(count) => count,
            Err(e) => {
                warn!(conn_id = %conn, user_id = %user, error = %e, "presence increment deferred");
                self.mark_stale();
                return;
            }
        };
        if !self.registry.mark_counted(conn, gate.epoch).await {
            // Gone while we were incrementing; its removal saw it uncounted.
            debug!(conn_id = %conn, "connection closed during increment, undoing");
            self.uncount(user).await;
            return;
        }
        debug!(conn_id = %conn, user_id = %user, count, "presence incremented");
        if count == 1 {
            info!(user_id = %user, "user online");
            self.announce(user, true).await;
        }
    }

    /// Un-count a connection that has been removed from the registry.
    pub async fn disconnected(&self, entry: &ConnectionEntry) {
        if entry.presence_epoch == 0 {
            debug!(conn_id = %entry.id, "connection was never counted");
            return;
        }
        let gate = self.gate.lock().await;
        if entry.presence_epoch != gate.epoch {
            debug!(conn_id = %entry.id, "connection already settled by a reconcile");
            return;
        }
        self.uncount(&entry.user_id).await;
    }

    /// Overwrite this instance's share of every user it holds or has local
    /// connections for, so the fleet total matches the registry again.
    pub async fn reconcile(&self) {
        let mut gate = self.gate.lock().await;
        gate.epoch += 1;
        let epoch = gate.epoch;
        self.stale.store(false, Ordering::Release);

        // Peers must not sweep the shares about to be written.
        if let Err(e) = self.fabric.keep_alive().await {
            warn!(error = %e, "reconcile interrupted, fabric unavailable");
            self.mark_stale();
            return;
        }

        let mut local: BTreeMap<UserId, Vec<ConnectionId>> = BTreeMap::new();
        for (conn, user) in self.registry.presence_snapshot().await {
            local.entry(user).or_default().push(conn);
        }
        let held = match self.fabric.presence_shares().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "reconcile interrupted, fabric unavailable");
                self.mark_stale();
                return;
            }
        };
        let users: BTreeSet<UserId> = local.keys().cloned().chain(held).collect();

        let mut changed = 0usize;
        for user in &users {
            let conns = local.get(user).map(Vec::as_slice).unwrap_or_default();
            let (before, after) = match self.fabric.set_presence_share(user, conns.len() as i64).await {
                Ok(totals) => totals,
                Err(e) => {
                    warn!(error = %e, "reconcile interrupted, fabric unavailable");
                    self.mark_stale();
                    return;
                }
            };
            for conn in conns {
                self.registry.mark_counted(conn, epoch).await;
            }
            if before == 0 && after > 0 {
                info!(user_id = %user, "user online");
                self.announce(user, true).await;
                changed += 1;
            } else if before > 0 && after == 0 {
                info!(user_id = %user, "user offline");
                self.announce(user, false).await;
                changed += 1;
            }
        }
        info!(users = users.len(), transitions = changed, epoch, "presence reconciled");
    }

    /// One maintenance round: refresh the liveness record, re-assert this
    /// instance's shares if they may be off, sweep dead instances.
    pub async fn maintain(&self) {
        match self.fabric.keep_alive().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("liveness record had lapsed, re-asserting presence");
                self.mark_stale();
            }
            Err(e) => {
                debug!(error = %e, "liveness refresh failed");
                return;
            }
        }
        if self.is_stale() {
            self.reconcile().await;
        }
        match self.fabric.sweep_dead().await {
            Ok(offline) => {
                for user in &offline {
                    info!(user_id = %user, "user offline, instance gone");
                    self.announce(user, false).await;
                }
            }
            Err(e) => debug!(error = %e, "presence sweep failed"),
        }
    }

    /// Run [`maintain`](Self::maintain) every `period` until the task is dropped.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            self.maintain().await;
        }
    }

    /// Online state of each user, read from the shared counter.
    pub async fn query(&self, users: &[UserId]) -> RoomcastResult<Vec<PresenceStatus>> {
        if users.len() > MAX_QUERY_USERS {
            return Err(RoomcastError::InvalidEvent(format!(
                "presence query for {} users (max {MAX_QUERY_USERS})",
                users.len()
            )));
        }
        if !self.fabric.is_connected() {
            return Err(RoomcastError::FabricUnavailable(
                "presence is unknown while the fabric is down".into(),
            ));
        }
        let mut statuses = Vec::with_capacity(users.len());
        for user in users {
            let count = self.fabric.presence_count(user).await?;
            statuses.push(PresenceStatus {
                user_id: user.clone(),
                online: count >= 1,
            });
        }
        Ok(statuses)
    }

    /// Whether a reconcile is owed.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Decrement for one connection. Caller holds the gate.
    async fn uncount(&self, user: &UserId) {
        match self.fabric.decrement_presence(user).await {
            Ok(count) => {
                debug!(user_id = %user, count, "presence decremented");
                if count == 0 {
                    info!(user_id = %user, "user offline");
                    self.announce(user, false).await;
                }
            }
            Err(e) => {
                warn!(user_id = %user, error = %e, "presence decrement deferred to reconcile");
                self.mark_stale();
            }
        }
    }

    async fn announce(&self, user: &UserId, online: bool) {
        self.broadcaster
            .publish(
                None,
                BroadcastEvent::PresenceChange {
                    user_id: user.clone(),
                    online,
                },
            )
            .await;
    }
}
