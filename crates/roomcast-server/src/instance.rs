//! One roomcast instance: registry, rooms, presence and relay wired to a
//! fabric. The gateway drives it with client events; the fabric pump drives
//! it with fleet events.

use crate::config::ServerConfig;
use crate::fabric::{Fabric, FabricInbound, FabricStatus};
use crate::fanout::LocalFanout;
use crate::handshake::Identity;
use crate::presence::PresenceCoordinator;
use crate::registry::{ConnectionEntry, LocalRegistry, Outbound};
use crate::relay::store::{directory_from_config, store_from_config, NoDirectory, NoStore};
use crate::relay::{Broadcaster, MessageRelay, MessageStore, TypingTracker, UserDirectory};
use crate::rooms::{membership, MembershipStore, RoomMembership, StaticMembership};
use roomcast_core::{
    codec, ClientEvent, ConnectionId, InstanceId, RoomId, RoomcastError, RoomcastResult,
    ServerEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// External services an instance consults.
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<dyn MembershipStore>,
    pub store: Arc<dyn MessageStore>,
    pub directory: Arc<dyn UserDirectory>,
}

impl Collaborators {
    pub fn from_config(config: &ServerConfig) -> RoomcastResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.lookup_timeout)
            .build()
            .map_err(|e| RoomcastError::Config(format!("http client: {e}")))?;
        Ok(Self {
            membership: membership::from_config(config, &client)?,
            store: store_from_config(config, &client)?,
            directory: directory_from_config(config, &client)?,
        })
    }

    /// Static membership from `config.rooms`, no store, no directory.
    #[cfg(test)]
    pub fn local(config: &ServerConfig) -> Self {
        Self {
            membership: Arc::new(StaticMembership::new(&config.rooms)),
            store: Arc::new(NoStore),
            directory: Arc::new(NoDirectory),
        }
    }
}

pub struct Instance {
    pub id: InstanceId,
    pub fabric: Arc<dyn Fabric>,
    pub registry: Arc<LocalRegistry>,
    pub rooms: Arc<RoomMembership>,
    pub fanout: Arc<LocalFanout>,
    pub presence: Arc<PresenceCoordinator>,
    pub relay: MessageRelay,
    pub typing: TypingTracker,
    accepting: AtomicBool,
}

impl Instance {
    pub fn new(config: &ServerConfig, fabric: Arc<dyn Fabric>, collaborators: Collaborators) -> Arc<Self> {
        let id = config.instance_id.clone();
        let registry = Arc::new(LocalRegistry::new(id.clone(), config.outbound_queue));
        let rooms = Arc::new(RoomMembership::new(
            registry.clone(),
            collaborators.membership,
            config.lookup_timeout,
        ));
        let fanout = Arc::new(LocalFanout::new(registry.clone(), rooms.clone()));
        let broadcaster = Arc::new(Broadcaster::new(id.clone(), fabric.clone(), fanout.clone()));
        let presence = Arc::new(PresenceCoordinator::new(
            fabric.clone(),
            registry.clone(),
            broadcaster.clone(),
        ));
        let relay = MessageRelay::new(
            rooms.clone(),
            broadcaster.clone(),
            collaborators.store,
            collaborators.directory,
            config.max_content_bytes,
            config.lookup_timeout,
        );
        let typing = TypingTracker::new(broadcaster, config.typing_timeout);

        Arc::new(Self {
            id,
            fabric,
            registry,
            rooms,
            fanout,
            presence,
            relay,
            typing,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Admit an authenticated connection: register it, greet it, count it.
    pub async fn connect(
        &self,
        identity: &Identity,
    ) -> RoomcastResult<(ConnectionId, mpsc::Receiver<Outbound>)> {
        if !self.is_accepting() {
            return Err(RoomcastError::Other("instance is draining".into()));
        }
        let user = identity.user_id.clone();
        let (conn, rx) = self.registry.register(user.clone()).await;
        self.reply(
            &conn,
            ServerEvent::Welcome {
                connection_id: conn.clone(),
                user_id: user.clone(),
                instance_id: self.id.clone(),
            },
        )
        .await;
        self.presence.connected(&conn, &user).await;
        Ok((conn, rx))
    }

    /// Handle one text frame from a client.
    pub async fn handle_text(&self, conn: &ConnectionId, text: &str) {
        self.registry.touch(conn).await;
        match codec::decode::<ClientEvent>(text) {
            Ok(event) => self.handle_event(conn, event).await,
            Err(e) => {
                debug!(conn_id = %conn, error = %e, "bad client frame");
                self.reply(conn, ServerEvent::from_error(&e, None)).await;
            }
        }
    }

    pub async fn handle_event(&self, conn: &ConnectionId, event: ClientEvent) {
        let Some(user) = self.registry.user_of(conn).await else {
            return;
        };
        match event {
            ClientEvent::Join { room_id } => match self.rooms.join(conn, &room_id).await {
                Ok(_) => self.reply(conn, ServerEvent::Joined { room_id }).await,
                Err(e) => self.reject(conn, &e, Some(room_id)).await,
            },
            ClientEvent::Leave { room_id } => {
                self.typing.stop(conn, &room_id).await;
                self.rooms.leave(conn, &room_id).await;
                self.reply(conn, ServerEvent::Left { room_id }).await;
            }
            ClientEvent::MessageSend { room_id, content } => {
                match self.relay.send(conn, &user, &room_id, content).await {
                    Ok(receipt) if !receipt.persisted => {
                        let err = RoomcastError::Persistence(format!(
                            "message {} was delivered but not stored",
                            receipt.message_id
                        ));
                        self.reject(conn, &err, Some(room_id)).await;
                    }
                    Ok(_) => {}
                    Err(e) => self.reject(conn, &e, Some(room_id)).await,
                }
            }
            ClientEvent::Typing { room_id, is_typing } => {
                if !self.rooms.is_subscribed(conn, &room_id).await {
                    let err = RoomcastError::Membership(format!("not joined to {room_id}"));
                    self.reject(conn, &err, Some(room_id)).await;
                    return;
                }
                self.typing.update(conn, &user, &room_id, is_typing).await;
            }
            ClientEvent::PresenceQuery { user_ids } => {
                match self.presence.query(&user_ids).await {
                    Ok(users) => self.reply(conn, ServerEvent::PresenceState { users }).await,
                    Err(e) => self.reject(conn, &e, None).await,
                }
            }
            ClientEvent::Ping {} => self.reply(conn, ServerEvent::Pong {}).await,
        }
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn disconnect(&self, conn: &ConnectionId) {
        let Some(entry) = self.registry.remove(conn).await else {
            return;
        };
        self.release(&entry).await;
        info!(
            conn_id = %conn,
            user_id = %entry.user_id,
            age_secs = entry.created_at.elapsed().as_secs(),
            "connection closed"
        );
    }

    /// Cleanup for an entry already removed from the registry.
    pub async fn release(&self, entry: &ConnectionEntry) {
        self.typing.cancel_connection(&entry.id).await;
        self.rooms.remove_connection(&entry.id, &entry.rooms).await;
        self.presence.disconnected(entry).await;
    }

    /// Deliver fabric events locally until the fabric goes away.
    pub async fn pump_fabric(self: Arc<Self>, mut inbound: mpsc::Receiver<FabricInbound>) {
        while let Some(item) = inbound.recv().await {
            match item {
                FabricInbound::Event(envelope) => {
                    let delivered = self.fanout.deliver(&envelope).await;
                    debug!(origin = %envelope.origin_instance, delivered, "fabric event delivered");
                }
                FabricInbound::Status(FabricStatus::Down) => {
                    warn!(instance_id = %self.id, "fabric down, delivering locally only");
                }
                FabricInbound::Status(FabricStatus::Up) => {
                    info!(instance_id = %self.id, "fabric up, reconciling presence");
                    let presence = self.presence.clone();
                    tokio::spawn(async move { presence.reconcile().await });
                }
            }
        }
        debug!(instance_id = %self.id, "fabric pump stopped");
    }

    async fn reply(&self, conn: &ConnectionId, event: ServerEvent) {
        self.registry
            .send_to(std::slice::from_ref(conn), &event, |_| true)
            .await;
    }

    /// Send an `error` event to one connection.
    pub async fn reject(&self, conn: &ConnectionId, err: &RoomcastError, room: Option<RoomId>) {
        self.reply(conn, ServerEvent::from_error(err, room)).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::fabric::{MemoryFabric, MemoryHub};
    use roomcast_core::UserId;
    use std::collections::HashMap;
    use std::time::Duration;

    pub(crate) struct Node {
        pub instance: Arc<Instance>,
        pub fabric: Arc<MemoryFabric>,
    }

    /// Spin up an instance on `hub` with its fabric pump running.
    pub(crate) fn node(hub: &Arc<MemoryHub>, name: &str) -> Node {
        let mut config = test_config(name);
        let mut rooms = HashMap::new();
        rooms.insert(
            "R1".to_string(),
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
        );
        config.rooms = rooms;
        let (fabric, inbound) = hub.attach(name.into());
        let fabric = Arc::new(fabric);
        let instance = Instance::new(&config, fabric.clone(), Collaborators::local(&config));
        tokio::spawn(instance.clone().pump_fabric(inbound));
        Node { instance, fabric }
    }

    pub(crate) fn identity(user: &str) -> Identity {
        Identity {
            user_id: UserId::from(user),
            expires_at: u64::MAX,
        }
    }

    /// Next event on `rx` that satisfies `pred`, within one second.
    pub(crate) async fn expect<F>(rx: &mut mpsc::Receiver<Outbound>, pred: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let item = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("connection queue closed");
            if let Outbound::Event(event) = item {
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    /// Collect everything that arrives on `rx` within `window`.
    pub(crate) async fn collect(rx: &mut mpsc::Receiver<Outbound>, window: Duration) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(item)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let Outbound::Event(event) = item {
                out.push(event);
            }
        }
        out
    }

    async fn join(node: &Node, conn: &ConnectionId, rx: &mut mpsc::Receiver<Outbound>, room: &str) {
        node.instance
            .handle_event(conn, ClientEvent::Join { room_id: room.into() })
            .await;
        expect(rx, |e| matches!(e, ServerEvent::Joined { .. })).await;
    }

    fn is_offline(e: &ServerEvent, user: &str) -> bool {
        matches!(e, ServerEvent::PresenceOffline { user_id } if user_id.as_str() == user)
    }

    #[tokio::test]
    async fn welcome_is_the_first_frame() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let (conn, mut rx) = n1.instance.connect(&identity("alice")).await.unwrap();
        match rx.recv().await {
            Some(Outbound::Event(ServerEvent::Welcome {
                connection_id,
                user_id,
                instance_id,
            })) => {
                assert_eq!(connection_id, conn);
                assert_eq!(user_id.as_str(), "alice");
                assert_eq!(instance_id.as_str(), "i1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_crosses_instances_exactly_once() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (x, mut rx_x) = n1.instance.connect(&identity("alice")).await.unwrap();
        let (y, mut rx_y) = n2.instance.connect(&identity("bob")).await.unwrap();
        join(&n1, &x, &mut rx_x, "R1").await;
        join(&n2, &y, &mut rx_y, "R1").await;

        n1.instance
            .handle_event(
                &x,
                ClientEvent::MessageSend {
                    room_id: "R1".into(),
                    content: "hello".into(),
                },
            )
            .await;

        let got = collect(&mut rx_y, Duration::from_millis(200)).await;
        let delivered: Vec<_> = got
            .iter()
            .filter_map(|e| match e {
                ServerEvent::MessageDelivered {
                    room_id,
                    sender_id,
                    content,
                    ..
                } => Some((room_id.as_str(), sender_id.as_str(), content.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![("R1", "alice", "hello")]);

        // no echo to the sender
        let mine = collect(&mut rx_x, Duration::from_millis(50)).await;
        assert!(!mine
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageDelivered { .. })));
    }

    #[tokio::test]
    async fn senders_other_connections_receive_the_message() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let (a1, mut rx_a1) = n1.instance.connect(&identity("alice")).await.unwrap();
        let (a2, mut rx_a2) = n1.instance.connect(&identity("alice")).await.unwrap();
        join(&n1, &a1, &mut rx_a1, "R1").await;
        join(&n1, &a2, &mut rx_a2, "R1").await;

        n1.instance
            .handle_event(
                &a1,
                ClientEvent::MessageSend {
                    room_id: "R1".into(),
                    content: "from tab one".into(),
                },
            )
            .await;
        expect(&mut rx_a2, |e| matches!(e, ServerEvent::MessageDelivered { .. })).await;
    }

    #[tokio::test]
    async fn non_member_join_is_rejected() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let (m, mut rx) = n1.instance.connect(&identity("mallory")).await.unwrap();

        n1.instance
            .handle_event(&m, ClientEvent::Join { room_id: "R1".into() })
            .await;
        let err = expect(&mut rx, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert!(matches!(err, ServerEvent::Error { ref code, .. } if code == "membership"));
        assert!(!n1.instance.rooms.is_subscribed(&m, &"R1".into()).await);

        // and cannot send there either
        n1.instance
            .handle_event(
                &m,
                ClientEvent::MessageSend {
                    room_id: "R1".into(),
                    content: "hi".into(),
                },
            )
            .await;
        let err = expect(&mut rx, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert!(matches!(err, ServerEvent::Error { ref code, .. } if code == "membership"));
    }

    #[tokio::test]
    async fn offline_waits_for_the_last_connection_in_the_fleet() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (_watcher, mut rx_w) = n2.instance.connect(&identity("carol")).await.unwrap();
        let (u1, _rx1) = n1.instance.connect(&identity("alice")).await.unwrap();
        let (u2, _rx2) = n2.instance.connect(&identity("alice")).await.unwrap();
        assert_eq!(hub.counter(&"alice".into()), 2);

        n1.instance.disconnect(&u1).await;
        let seen = collect(&mut rx_w, Duration::from_millis(150)).await;
        assert!(!seen.iter().any(|e| is_offline(e, "alice")));

        n2.instance.disconnect(&u2).await;
        expect(&mut rx_w, |e| is_offline(e, "alice")).await;
        assert_eq!(hub.counter(&"alice".into()), 0);
    }

    #[tokio::test]
    async fn outage_messages_stay_local_and_are_not_replayed() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (x, mut rx_x) = n1.instance.connect(&identity("alice")).await.unwrap();
        let (z, mut rx_z) = n1.instance.connect(&identity("carol")).await.unwrap();
        let (y, mut rx_y) = n2.instance.connect(&identity("bob")).await.unwrap();
        join(&n1, &x, &mut rx_x, "R1").await;
        join(&n1, &z, &mut rx_z, "R1").await;
        join(&n2, &y, &mut rx_y, "R1").await;
        collect(&mut rx_y, Duration::from_millis(50)).await;

        n1.fabric.sever();
        n1.instance
            .handle_event(
                &x,
                ClientEvent::MessageSend {
                    room_id: "R1".into(),
                    content: "during outage".into(),
                },
            )
            .await;
        expect(&mut rx_z, |e| matches!(e, ServerEvent::MessageDelivered { .. })).await;

        n1.fabric.restore();
        let remote = collect(&mut rx_y, Duration::from_millis(200)).await;
        assert!(!remote
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageDelivered { .. })));
    }

    #[tokio::test]
    async fn connection_made_during_outage_is_counted_on_recovery() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (_w, mut rx_w) = n2.instance.connect(&identity("carol")).await.unwrap();

        n1.fabric.sever();
        let (a, _rx_a) = n1.instance.connect(&identity("alice")).await.unwrap();
        assert_eq!(hub.counter(&"alice".into()), 0);

        n1.fabric.restore();
        expect(&mut rx_w, |e| {
            matches!(e, ServerEvent::PresenceOnline { user_id } if user_id.as_str() == "alice")
        })
        .await;
        assert_eq!(hub.counter(&"alice".into()), 1);

        n1.instance.disconnect(&a).await;
        expect(&mut rx_w, |e| is_offline(e, "alice")).await;
        assert_eq!(hub.counter(&"alice".into()), 0);
    }

    #[tokio::test]
    async fn crashed_instance_does_not_keep_users_online() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (_w, mut rx_w) = n2.instance.connect(&identity("carol")).await.unwrap();
        n1.instance.connect(&identity("alice")).await.unwrap();

        // i1 dies without draining
        hub.kill(&"i1".into());
        let (a, _rx_a) = n2.instance.connect(&identity("alice")).await.unwrap();
        n2.instance.disconnect(&a).await;
        let seen = collect(&mut rx_w, Duration::from_millis(100)).await;
        assert!(!seen.iter().any(|e| is_offline(e, "alice")));

        n2.instance.presence.maintain().await;
        expect(&mut rx_w, |e| is_offline(e, "alice")).await;
        assert_eq!(hub.counter(&"alice".into()), 0);
    }

    #[tokio::test]
    async fn shares_are_rebuilt_after_the_broker_loses_its_state() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (_w, mut rx_w) = n2.instance.connect(&identity("carol")).await.unwrap();
        let (a, _rx_a) = n1.instance.connect(&identity("alice")).await.unwrap();
        collect(&mut rx_w, Duration::from_millis(50)).await;

        // broker restarts empty; i1 sees its link drop and return
        n1.fabric.sever();
        hub.lose_state();
        n1.fabric.restore();
        expect(&mut rx_w, |e| {
            matches!(e, ServerEvent::PresenceOnline { user_id } if user_id.as_str() == "alice")
        })
        .await;
        assert_eq!(hub.counter(&"alice".into()), 1);

        // i2 finds its lapsed record on the next maintenance round
        assert_eq!(hub.counter(&"carol".into()), 0);
        n2.instance.presence.maintain().await;
        assert_eq!(hub.counter(&"carol".into()), 1);

        n1.instance.disconnect(&a).await;
        expect(&mut rx_w, |e| is_offline(e, "alice")).await;
        assert_eq!(hub.counter(&"alice".into()), 0);
    }

    #[tokio::test]
    async fn typing_expires_for_remote_subscribers() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (x, mut rx_x) = n1.instance.connect(&identity("alice")).await.unwrap();
        let (y, mut rx_y) = n2.instance.connect(&identity("bob")).await.unwrap();
        join(&n1, &x, &mut rx_x, "R1").await;
        join(&n2, &y, &mut rx_y, "R1").await;

        n1.instance
            .handle_event(
                &x,
                ClientEvent::Typing {
                    room_id: "R1".into(),
                    is_typing: true,
                },
            )
            .await;
        expect(&mut rx_y, |e| matches!(e, ServerEvent::Typing { is_typing: true, .. })).await;
        expect(&mut rx_y, |e| matches!(e, ServerEvent::Typing { is_typing: false, .. })).await;

        // the typist never hears about it
        let own = collect(&mut rx_x, Duration::from_millis(50)).await;
        assert!(!own.iter().any(|e| matches!(e, ServerEvent::Typing { .. })));
    }

    #[tokio::test]
    async fn bad_frames_get_an_error_event() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let (a, mut rx) = n1.instance.connect(&identity("alice")).await.unwrap();
        n1.instance.handle_text(&a, "{not json").await;
        let err = expect(&mut rx, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert!(matches!(err, ServerEvent::Error { ref code, .. } if code == "invalid_event"));

        n1.instance.handle_text(&a, r#"{"event":"ping"}"#).await;
        expect(&mut rx, |e| matches!(e, ServerEvent::Pong {})).await;
    }

    #[tokio::test]
    async fn presence_query_answers_from_the_fleet() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        let n2 = node(&hub, "i2");
        let (q, mut rx) = n1.instance.connect(&identity("carol")).await.unwrap();
        n2.instance.connect(&identity("bob")).await.unwrap();

        n1.instance
            .handle_event(
                &q,
                ClientEvent::PresenceQuery {
                    user_ids: vec!["bob".into(), "dave".into()],
                },
            )
            .await;
        let state = expect(&mut rx, |e| matches!(e, ServerEvent::PresenceState { .. })).await;
        let ServerEvent::PresenceState { users } = state else {
            unreachable!()
        };
        assert_eq!(users.len(), 2);
        assert!(users[0].online);
        assert!(!users[1].online);
    }

    #[tokio::test]
    async fn draining_instance_refuses_connections() {
        let hub = MemoryHub::new();
        let n1 = node(&hub, "i1");
        n1.instance.stop_accepting();
        assert!(n1.instance.connect(&identity("alice")).await.is_err());
        assert_eq!(n1.instance.registry.len().await, 0);
    }
}
