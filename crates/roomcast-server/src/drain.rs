//! Shutdown drain.
//!
//! Takes an instance out of the fleet in order:
//! 1. stop accepting connections
//! 2. wait for outbound queues to empty (bounded by the grace period)
//! 3. unsubscribe from the fabric
//! 4. release every local connection once: presence decrement, `shutdown`
//!    event, close
//! 5. close the fabric client
//!
//! The caller bounds the whole drain with a hard timeout.

use crate::instance::Instance;
use crate::registry::CloseReason;
use crate::transport::ListenerHandle;
use roomcast_core::ServerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const FLUSH_POLL: Duration = Duration::from_millis(20);

/// What a drain did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections released.
    pub closed: usize,
    /// Whether every outbound queue emptied within the grace period.
    pub flushed: bool,
}

pub struct DrainController {
    instance: Arc<Instance>,
    grace: Duration,
}

impl DrainController {
    pub fn new(instance: Arc<Instance>, grace: Duration) -> Self {
        Self { instance, grace }
    }

    pub async fn drain(&self, listener: Option<&ListenerHandle>) -> DrainReport {
        info!(instance_id = %self.instance.id, "draining");

        self.instance.stop_accepting();
        if let Some(listener) = listener {
            listener.stop();
        }

        let flushed = self.flush().await;
        if !flushed {
            warn!(
                pending = self.instance.registry.pending_outbound().await,
                "grace period elapsed with events still queued"
            );
        }

        if let Err(e) = self.instance.fabric.unsubscribe().await {
            warn!(error = %e, "fabric unsubscribe failed");
        }

        let entries = self.instance.registry.drain_all().await;
        let closed = entries.len();
        for entry in &entries {
            self.instance.release(entry).await;
            entry.send(ServerEvent::Shutdown {
                reason: "server shutting down".into(),
            });
            entry.close(CloseReason::Shutdown);
        }

        if let Err(e) = self.instance.fabric.close().await {
            warn!(error = %e, "fabric close failed");
        }

        info!(closed, flushed, "drain complete");
        DrainReport { closed, flushed }
    }

    /// Wait until nothing is queued for any connection, up to the grace period.
    async fn flush(&self) -> bool {
        let deadline = Instant::now() + self.grace;
        loop {
            if self.instance.registry.pending_outbound().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(FLUSH_POLL).await;
        }
    }
}
