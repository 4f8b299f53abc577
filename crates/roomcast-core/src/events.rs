//! Client-facing wire events.
//!
//! One JSON object per WebSocket text frame, discriminated by `event`.

use crate::ids::{ConnectionId, InstanceId, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Events a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join { room_id: RoomId },

    #[serde(rename = "leave")]
    Leave { room_id: RoomId },

    #[serde(rename = "message.send")]
    MessageSend { room_id: RoomId, content: String },

    #[serde(rename = "typing")]
    Typing { room_id: RoomId, is_typing: bool },

    #[serde(rename = "presence.query")]
    PresenceQuery { user_ids: Vec<UserId> },

    #[serde(rename = "ping")]
    Ping {},
}

/// Online state of one user, as answered to `presence.query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    pub user_id: UserId,
    pub online: bool,
}

/// Events the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "welcome")]
    Welcome {
        connection_id: ConnectionId,
        user_id: UserId,
        instance_id: InstanceId,
    },

    #[serde(rename = "joined")]
    Joined { room_id: RoomId },

    #[serde(rename = "left")]
    Left { room_id: RoomId },

    #[serde(rename = "message.delivered")]
    MessageDelivered {
        room_id: RoomId,
        message_id: MessageId,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        content: String,
        timestamp: u64,
    },

    #[serde(rename = "typing")]
    Typing {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },

    #[serde(rename = "presence.online")]
    PresenceOnline { user_id: UserId },

    #[serde(rename = "presence.offline")]
    PresenceOffline { user_id: UserId },

    #[serde(rename = "presence.state")]
    PresenceState { users: Vec<PresenceStatus> },

    #[serde(rename = "error")]
    Error {
        code: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },

    #[serde(rename = "shutdown")]
    Shutdown { reason: String },

    #[serde(rename = "pong")]
    Pong {},
}

impl ServerEvent {
    /// Build an `error` event from a typed error.
    pub fn from_error(err: &crate::RoomcastError, room_id: Option<RoomId>) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            reason: err.to_string(),
            room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_use_dotted_names_and_camel_case() {
        let ev: ClientEvent =
            serde_json::from_value(json!({"event": "message.send", "roomId": "R1", "content": "hi"}))
                .unwrap();
        assert_eq!(
            ev,
            ClientEvent::MessageSend {
                room_id: RoomId::from("R1"),
                content: "hi".into()
            }
        );

        let ev: ClientEvent =
            serde_json::from_value(json!({"event": "typing", "roomId": "R1", "isTyping": true}))
                .unwrap();
        assert!(matches!(ev, ClientEvent::Typing { is_typing: true, .. }));

        let ev: ClientEvent = serde_json::from_value(json!({"event": "ping"})).unwrap();
        assert_eq!(ev, ClientEvent::Ping {});
    }

    #[test]
    fn delivered_message_shape() {
        let ev = ServerEvent::MessageDelivered {
            room_id: "R1".into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
            sender_name: None,
            content: "hello".into(),
            timestamp: 42,
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "message.delivered",
                "roomId": "R1",
                "messageId": "m1",
                "senderId": "u1",
                "content": "hello",
                "timestamp": 42
            })
        );
    }

    #[test]
    fn unknown_event_is_rejected() {
        let res: Result<ClientEvent, _> = serde_json::from_value(json!({"event": "nope"}));
        assert!(res.is_err());
    }
}
