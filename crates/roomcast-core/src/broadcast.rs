//! Events exchanged between instances over the broadcast fabric.

use crate::events::ServerEvent;
use crate::ids::{ConnectionId, InstanceId, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// A cross-instance event. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastEvent {
    RoomMessage {
        room_id: RoomId,
        message_id: MessageId,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        content: String,
        timestamp: u64,
    },
    TypingSignal {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    PresenceChange {
        user_id: UserId,
        online: bool,
    },
}

impl BroadcastEvent {
    /// The fabric channel this event is published on.
    pub fn channel(&self) -> Channel {
        match self {
            BroadcastEvent::RoomMessage { room_id, .. }
            | BroadcastEvent::TypingSignal { room_id, .. } => Channel::Room(room_id.clone()),
            BroadcastEvent::PresenceChange { .. } => Channel::Presence,
        }
    }

    /// The client-facing form of this event.
    pub fn to_server_event(&self) -> ServerEvent {
        match self {
            BroadcastEvent::RoomMessage {
                room_id,
                message_id,
                sender_id,
                sender_name,
                content,
                timestamp,
            } => ServerEvent::MessageDelivered {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
                sender_id: sender_id.clone(),
                sender_name: sender_name.clone(),
                content: content.clone(),
                timestamp: *timestamp,
            },
            BroadcastEvent::TypingSignal {
                room_id,
                user_id,
                is_typing,
            } => ServerEvent::Typing {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                is_typing: *is_typing,
            },
            BroadcastEvent::PresenceChange { user_id, online: true } => {
                ServerEvent::PresenceOnline {
                    user_id: user_id.clone(),
                }
            }
            BroadcastEvent::PresenceChange {
                user_id,
                online: false,
            } => ServerEvent::PresenceOffline {
                user_id: user_id.clone(),
            },
        }
    }
}

/// Logical fabric channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Room-scoped: messages and typing signals.
    Room(RoomId),
    /// Fleet-wide: presence transitions.
    Presence,
}

impl Channel {
    /// Broker channel name under `prefix`.
    pub fn name(&self, prefix: &str) -> String {
        match self {
            Channel::Room(room) => format!("{prefix}:room:{room}"),
            Channel::Presence => format!("{prefix}:presence"),
        }
    }

    /// Pattern matching every room channel under `prefix`.
    pub fn room_pattern(prefix: &str) -> String {
        format!("{prefix}:room:*")
    }

    /// Inverse of [`Channel::name`]. Returns `None` for foreign channels.
    pub fn parse(prefix: &str, name: &str) -> Option<Channel> {
        let rest = name.strip_prefix(prefix)?.strip_prefix(':')?;
        if rest == "presence" {
            return Some(Channel::Presence);
        }
        let room = rest.strip_prefix("room:")?;
        if room.is_empty() {
            return None;
        }
        Some(Channel::Room(RoomId::from(room)))
    }
}

/// What actually travels on the fabric: the event plus its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricEnvelope {
    pub origin_instance: InstanceId,
    /// Set for client-authored events so the origin connection can be skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_connection: Option<ConnectionId>,
    pub event: BroadcastEvent,
}
