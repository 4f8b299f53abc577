//! Local fan-out of fabric events.
//!
//! Delivers an envelope to this instance's own connections and nothing else.
//! It never publishes: an instance that receives its own event back from the
//! fabric delivers it here exactly once.

use crate::registry::LocalRegistry;
use crate::rooms::RoomMembership;
use roomcast_core::{BroadcastEvent, FabricEnvelope};
use std::sync::Arc;
use tracing::debug;

pub struct LocalFanout {
    registry: Arc<LocalRegistry>,
    rooms: Arc<RoomMembership>,
}

impl LocalFanout {
    pub fn new(registry: Arc<LocalRegistry>, rooms: Arc<RoomMembership>) -> Self {
        Self { registry, rooms }
    }

    /// Deliver to local recipients. Returns how many connections got it.
    ///
    /// - room messages: room subscribers except the origin connection
    /// - typing signals: room subscribers except the typing user's connections
    /// - presence changes: every local connection
    pub async fn deliver(&self, envelope: &FabricEnvelope) -> usize {
        let event = envelope.event.to_server_event();
        match &envelope.event {
            BroadcastEvent::RoomMessage { room_id, .. } => {
                let subscribers = self.rooms.subscribers(room_id).await;
                if subscribers.is_empty() {
                    debug!(room_id = %room_id, "no local subscribers, dropping");
                    return 0;
                }
                let origin = self.local_origin(envelope);
                self.registry
                    .send_to(&subscribers, &event, |entry| Some(&entry.id) != origin)
                    .await
            }
            BroadcastEvent::TypingSignal { room_id, user_id, .. } => {
                let subscribers = self.rooms.subscribers(room_id).await;
                if subscribers.is_empty() {
                    return 0;
                }
                self.registry
                    .send_to(&subscribers, &event, |entry| &entry.user_id != user_id)
                    .await
            }
            BroadcastEvent::PresenceChange { .. } => self.registry.broadcast(&event).await,
        }
    }

    /// The origin connection, if it lives on this instance.
    fn local_origin<'a>(&self, envelope: &'a FabricEnvelope) -> Option<&'a roomcast_core::ConnectionId> {
        if &envelope.origin_instance == self.registry.instance_id() {
            envelope.origin_connection.as_ref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use crate::rooms::OpenMembership;
    use roomcast_core::ServerEvent;
    use std::time::Duration;

    async fn setup() -> (Arc<LocalRegistry>, Arc<RoomMembership>, LocalFanout) {
        let registry = Arc::new(LocalRegistry::new("i1".into(), 8));
        let rooms = Arc::new(RoomMembership::new(
            registry.clone(),
            Arc::new(OpenMembership),
            Duration::from_secs(1),
        ));
        let fanout = LocalFanout::new(registry.clone(), rooms.clone());
        (registry, rooms, fanout)
    }

    fn message(origin_instance: &str, origin_conn: Option<&roomcast_core::ConnectionId>) -> FabricEnvelope {
        FabricEnvelope {
            origin_instance: origin_instance.into(),
            origin_connection: origin_conn.cloned(),
            event: BroadcastEvent::RoomMessage {
                room_id: "R1".into(),
                message_id: "m1".into(),
                sender_id: "alice".into(),
                sender_name: None,
                content: "hello".into(),
                timestamp: 1,
            },
        }
    }

    #[tokio::test]
    async fn room_message_skips_origin_connection() {
        let (registry, rooms, fanout) = setup().await;
        let (a1, mut rx_a1) = registry.register("alice".into()).await;
        let (a2, mut rx_a2) = registry.register("alice".into()).await;
        let (b, mut rx_b) = registry.register("bob".into()).await;
        for c in [&a1, &a2, &b] {
            rooms.join(c, &"R1".into()).await.unwrap();
        }

        assert_eq!(fanout.deliver(&message("i1", Some(&a1))).await, 2);
        assert!(rx_a1.try_recv().is_err());
        assert!(matches!(
            rx_a2.recv().await,
            Some(Outbound::Event(ServerEvent::MessageDelivered { .. }))
        ));
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn remote_origin_is_not_excluded_and_unsubscribed_get_nothing() {
        let (registry, rooms, fanout) = setup().await;
        let (a, mut rx_a) = registry.register("alice".into()).await;
        let (_c, mut rx_c) = registry.register("carol".into()).await;
        rooms.join(&a, &"R1".into()).await.unwrap();

        // same connection id, but published by another instance
        assert_eq!(fanout.deliver(&message("i2", Some(&a))).await, 1);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_skips_all_of_the_typists_connections() {
        let (registry, rooms, fanout) = setup().await;
        let (a1, mut rx_a1) = registry.register("alice".into()).await;
        let (a2, mut rx_a2) = registry.register("alice".into()).await;
        let (b, mut rx_b) = registry.register("bob".into()).await;
        for c in [&a1, &a2, &b] {
            rooms.join(c, &"R1".into()).await.unwrap();
        }

        let env = FabricEnvelope {
            origin_instance: "i1".into(),
            origin_connection: Some(a1.clone()),
            event: BroadcastEvent::TypingSignal {
                room_id: "R1".into(),
                user_id: "alice".into(),
                is_typing: true,
            },
        };
        assert_eq!(fanout.deliver(&env).await, 1);
        assert!(rx_a1.try_recv().is_err());
        assert!(rx_a2.try_recv().is_err());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn presence_goes_to_everyone() {
        let (registry, _rooms, fanout) = setup().await;
        let (_a, mut rx_a) = registry.register("alice".into()).await;
        let (_b, mut rx_b) = registry.register("bob".into()).await;

        let env = FabricEnvelope {
            origin_instance: "i2".into(),
            origin_connection: None,
            event: BroadcastEvent::PresenceChange {
                user_id: "carol".into(),
                online: true,
            },
        };
        assert_eq!(fanout.deliver(&env).await, 2);
        let expected = Outbound::Event(ServerEvent::PresenceOnline {
            user_id: "carol".into(),
        });
        assert_eq!(rx_a.recv().await, Some(expected.clone()));
        assert_eq!(rx_b.recv().await, Some(expected));
    }
}
