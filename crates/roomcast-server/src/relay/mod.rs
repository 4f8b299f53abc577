//! Message relay.
//!
//! [`Broadcaster`] is the only way events leave an instance: publish on the
//! fabric, and if the fabric is unavailable deliver to the local fan-out
//! instead (degraded mode, no replay later).
//!
//! [`MessageRelay`] handles `message.send`: membership check, content
//! validation, a bounded attempt to persist, then publication. Persistence
//! and live delivery have independent outcomes.

pub mod store;
pub mod typing;

pub use store::{MessageStore, StoredMessage, UserDirectory};
pub use typing::TypingTracker;

use crate::fabric::Fabric;
use crate::fanout::LocalFanout;
use crate::rooms::RoomMembership;
use roomcast_core::{
    epoch_ms, BroadcastEvent, ConnectionId, FabricEnvelope, InstanceId, MessageId, RoomId,
    RoomcastError, RoomcastResult, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a published event went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the fabric; every instance delivers it.
    Fabric,
    /// Fabric unavailable; delivered to this instance's subscribers only.
    LocalOnly,
}

pub struct Broadcaster {
    instance_id: InstanceId,
    fabric: Arc<dyn Fabric>,
    fanout: Arc<LocalFanout>,
}

impl Broadcaster {
    pub fn new(instance_id: InstanceId, fabric: Arc<dyn Fabric>, fanout: Arc<LocalFanout>) -> Self {
        Self {
            instance_id,
            fabric,
            fanout,
        }
    }

    pub async fn publish(
        &self,
        origin_connection: Option<ConnectionId>,
        event: BroadcastEvent,
    ) -> Delivery {
        let envelope = FabricEnvelope {
            origin_instance: self.instance_id.clone(),
            origin_connection,
            event,
        };
        match self.fabric.publish(&envelope).await {
            Ok(()) => Delivery::Fabric,
            Err(e) => {
                warn!(error = %e, "publish failed, delivering locally only");
                let delivered = self.fanout.deliver(&envelope).await;
                debug!(delivered, "degraded local delivery");
                Delivery::LocalOnly
            }
        }
    }
}

/// Result of a successful `message.send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    /// `false` if the store write failed or timed out.
    pub persisted: bool,
    pub delivery: Delivery,
}

pub struct MessageRelay {
    rooms: Arc<RoomMembership>,
    broadcaster: Arc<Broadcaster>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    max_content_bytes: usize,
    lookup_timeout: Duration,
}

impl MessageRelay {
    pub fn new(
        rooms: Arc<RoomMembership>,
        broadcaster: Arc<Broadcaster>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        max_content_bytes: usize,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            rooms,
            broadcaster,
            store,
            directory,
            max_content_bytes,
            lookup_timeout,
        }
    }

    /// Relay `content` from `conn` (owned by `sender`) to `room`.
    ///
    /// Rejected without publishing if the connection has not joined the room
    /// or the content is invalid.
    pub async fn send(
        &self,
        conn: &ConnectionId,
        sender: &UserId,
        room: &RoomId,
        content: String,
    ) -> RoomcastResult<SendReceipt> {
        if !self.rooms.is_subscribed(conn, room).await {
            return Err(RoomcastError::Membership(format!("not joined to {room}")));
        }
        validate_content(&content, self.max_content_bytes)?;

        let message = StoredMessage {
            message_id: MessageId::generate(),
            room_id: room.clone(),
            sender_id: sender.clone(),
            content,
            timestamp: epoch_ms(),
        };

        let persisted = match tokio::time::timeout(self.lookup_timeout, self.store.persist(&message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(message_id = %message.message_id, room_id = %room, error = %e, "message not persisted");
                false
            }
            Err(_) => {
                warn!(message_id = %message.message_id, room_id = %room, "message store timed out");
                false
            }
        };

        let sender_name = match tokio::time::timeout(self.lookup_timeout, self.directory.display_name(sender)).await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                debug!(user_id = %sender, error = %e, "display name lookup failed");
                None
            }
            Err(_) => None,
        };

        let StoredMessage {
            message_id,
            room_id,
            sender_id,
            content,
            timestamp,
        } = message;
        let delivery = self
            .broadcaster
            .publish(
                Some(conn.clone()),
                BroadcastEvent::RoomMessage {
                    room_id,
                    message_id: message_id.clone(),
                    sender_id,
                    sender_name,
                    content,
                    timestamp,
                },
            )
            .await;
        info!(conn_id = %conn, room_id = %room, message_id = %message_id, persisted, ?delivery, "message relayed");

        Ok(SendReceipt {
            message_id,
            persisted,
            delivery,
        })
    }
}

fn validate_content(content: &str, max_bytes: usize) -> RoomcastResult<()> {
    if content.trim().is_empty() {
        return Err(RoomcastError::InvalidContent("message is empty".into()));
    }
    if content.len() > max_bytes {
        return Err(RoomcastError::InvalidContent(format!(
            "message is {} bytes (max {max_bytes})",
            content.len()
        )));
    }
    Ok(())
}
