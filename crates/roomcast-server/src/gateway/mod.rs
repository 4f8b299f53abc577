//! Connection gateway.
//!
//! Takes authenticated WebSocket connections from the listener and runs one
//! [`session`] task per connection:
//!
//! ```text
//! listener (handshake in upgrade callback)
//!   → Gateway::serve
//!     → session::run
//!         → Instance::connect      (registry, welcome, presence)
//!         → inbound worker         (Instance::handle_text, in order)
//!         → outbound queue → socket
//!         → Instance::disconnect   (close, error, heartbeat timeout)
//! ```

pub mod session;

use crate::config::ServerConfig;
use crate::instance::Instance;
use crate::transport::WebSocketConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Ping cadence and the silence after which a connection is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Heartbeat {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
        }
    }
}

pub struct Gateway {
    instance: Arc<Instance>,
    heartbeat: Heartbeat,
}

impl Gateway {
    pub fn new(instance: Arc<Instance>, heartbeat: Heartbeat) -> Self {
        Self { instance, heartbeat }
    }

    /// Spawn a session for every accepted connection until the listener
    /// channel closes.
    pub async fn serve(self, mut connections: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = connections.recv().await {
            tokio::spawn(session::run(self.instance.clone(), conn, self.heartbeat));
        }
        debug!("gateway stopped");
    }
}
