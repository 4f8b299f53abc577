//! Distributed broadcast fabric.
//!
//! The only channel of cross-instance coordination. Every instance connects
//! at startup and stays subscribed to the room channels and the global
//! presence channel. Events received from the fabric are handed to the
//! instance through an `mpsc` channel of [`FabricInbound`] items; they are
//! delivered locally and never re-published.
//!
//! # Backends
//!
//! - **[`redis`]**: `redis://` URLs. `PUBLISH` / `PSUBSCRIBE`, Lua scripts
//!   for the presence shares, and a supervisor task that reconnects with
//!   backoff.
//! - **[`memory`]**: `memory://`. In-process hub with the same semantics,
//!   for single-node runs and multi-instance tests.
//!
//! # Presence shares
//!
//! A user's fleet-wide count is the sum of per-instance shares; each
//! instance only ever moves its own share. Every instance also keeps a
//! liveness record alive with [`Fabric::keep_alive`]. When an instance dies
//! without draining, its record lapses and any peer's [`Fabric::sweep_dead`]
//! drops its shares, so users it held go offline fleet-wide.
//!
//! Ordering: events published by one publisher on one channel arrive in
//! order. Nothing else is ordered.

pub mod backoff;
pub mod memory;
pub mod redis;

pub use backoff::Backoff;
pub use memory::{MemoryFabric, MemoryHub};
pub use self::redis::RedisFabric;

use crate::config::ServerConfig;
use roomcast_core::{FabricEnvelope, RoomcastError, RoomcastResult, UserId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Capacity of the inbound event channel.
pub const INBOUND_CAPACITY: usize = 4096;

/// Boxed future returned by fabric operations.
pub type FabricFuture<'a, T> = Pin<Box<dyn Future<Output = RoomcastResult<T>> + Send + 'a>>;

/// Link state changes reported alongside inbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricStatus {
    /// Broker lost; the instance runs local-only.
    Down,
    /// Broker reachable again.
    Up,
}

/// Items the fabric hands to its instance.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricInbound {
    Event(FabricEnvelope),
    Status(FabricStatus),
}

/// Publish/subscribe transport plus the fleet-wide presence counter.
pub trait Fabric: Send + Sync {
    /// Publish on the channel the event's scope maps to.
    fn publish<'a>(&'a self, envelope: &'a FabricEnvelope) -> FabricFuture<'a, ()>;

    /// Add one to this instance's share for `user`; returns the fleet total.
    fn increment_presence<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64>;

    /// Take one from this instance's share for `user`. Returns the fleet
    /// total, or `-1` if this instance's share was already zero (no
    /// transition happened).
    fn decrement_presence<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64>;

    /// Fleet-wide live-connection count for `user`.
    fn presence_count<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64>;

    /// Overwrite this instance's share for `user` (zero removes it).
    /// Returns the fleet total before and after.
    fn set_presence_share<'a>(&'a self, user: &'a UserId, share: i64) -> FabricFuture<'a, (i64, i64)>;

    /// Users this instance holds a non-zero share for.
    fn presence_shares(&self) -> FabricFuture<'_, Vec<UserId>>;

    /// Refresh this instance's liveness record. `false` means the record had
    /// lapsed, so the broker may have dropped this instance's shares.
    fn keep_alive(&self) -> FabricFuture<'_, bool>;

    /// Drop the shares of instances whose liveness record lapsed. Returns
    /// the users whose fleet total fell to zero as a result.
    fn sweep_dead(&self) -> FabricFuture<'_, Vec<UserId>>;

    /// Stop receiving events. Publishing and counters keep working.
    fn unsubscribe(&self) -> FabricFuture<'_, ()>;

    /// Close the fabric client.
    fn close(&self) -> FabricFuture<'_, ()>;

    fn is_connected(&self) -> bool;
}

pub(crate) fn unavailable(reason: impl Into<String>) -> RoomcastError {
    RoomcastError::FabricUnavailable(reason.into())
}

/// Connect the configured backend. Failure here is fatal at startup.
pub async fn connect(
    config: &ServerConfig,
) -> RoomcastResult<(Arc<dyn Fabric>, mpsc::Receiver<FabricInbound>)> {
    let url = config.fabric_url.as_str();
    if url.starts_with("memory://") {
        info!("using in-process memory fabric");
        let hub = MemoryHub::new();
        let (fabric, rx) = hub.attach(config.instance_id.clone());
        return Ok((Arc::new(fabric), rx));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let backoff = Backoff::new(config.reconnect_min, config.reconnect_max);
        let fabric = RedisFabric::connect(
            url,
            &config.channel_prefix,
            config.instance_id.clone(),
            config.liveness_ttl,
            backoff,
            tx,
        )
        .await?;
        return Ok((Arc::new(fabric), rx));
    }
    Err(RoomcastError::Config(format!("unsupported fabric url: {url}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[tokio::test]
    async fn memory_url_connects_in_process() {
        let (fabric, _rx) = connect(&test_config("i1")).await.unwrap();
        assert!(fabric.is_connected());
        assert!(fabric.keep_alive().await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_at_startup() {
        let mut config = test_config("i1");
        config.fabric_url = "redis://127.0.0.1:1".into();
        match connect(&config).await {
            Err(RoomcastError::FabricUnavailable(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_config_error() {
        let mut config = test_config("i1");
        config.fabric_url = "nats://127.0.0.1:4222".into();
        assert!(matches!(connect(&config).await, Err(RoomcastError::Config(_))));
    }
}
