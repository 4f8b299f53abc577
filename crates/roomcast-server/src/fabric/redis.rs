//! Redis-backed fabric.
//!
//! Two connections per instance: a multiplexed one for `PUBLISH` and the
//! presence scripts, and a pub/sub one that `PSUBSCRIBE`s every room channel
//! and `SUBSCRIBE`s the presence channel. A supervisor task owns the pub/sub
//! side; when its stream ends it reports [`FabricStatus::Down`], reconnects
//! with backoff and reports [`FabricStatus::Up`] once both connections are
//! back.
//!
//! Presence keys under `prefix`:
//!
//! ```text
//! {prefix}:presence:count:{user}      hash   instance → share
//! {prefix}:presence:shares:{instance} set    users the instance holds a share for
//! {prefix}:instance:{instance}:alive  string liveness record, expires after the TTL
//! {prefix}:instances                  set    instances that may hold shares
//! ```
//!
//! The sweep script builds count keys from the shares set, so all presence
//! keys of a fleet must live on one Redis node.

use super::{unavailable, Backoff, Fabric, FabricFuture, FabricInbound, FabricStatus};
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use roomcast_core::{codec, Channel, FabricEnvelope, InstanceId, RoomcastResult, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// KEYS: count hash, own shares set, instances set. ARGV: instance, user.
/// Returns the fleet total.
const INCREMENT_SCRIPT: &str = r#"
redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
local total = 0
for _, v in ipairs(redis.call('HVALS', KEYS[1])) do total = total + tonumber(v) end
return total
"#;

/// KEYS: count hash, own shares set. ARGV: instance, user.
/// Returns the fleet total, or -1 if this instance's share was already zero.
const DECREMENT_SCRIPT: &str = r#"
local share = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
if share <= 0 then return -1 end
if share == 1 then
  redis.call('HDEL', KEYS[1], ARGV[1])
  redis.call('SREM', KEYS[2], ARGV[2])
else
  redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
end
local total = 0
for _, v in ipairs(redis.call('HVALS', KEYS[1])) do total = total + tonumber(v) end
return total
"#;

/// KEYS: count hash, own shares set, instances set. ARGV: instance, user, share.
/// Returns `{before, after}` fleet totals.
const SET_SHARE_SCRIPT: &str = r#"
local function total()
  local t = 0
  for _, v in ipairs(redis.call('HVALS', KEYS[1])) do t = t + tonumber(v) end
  return t
end
local before = total()
local share = tonumber(ARGV[3])
if share > 0 then
  redis.call('HSET', KEYS[1], ARGV[1], share)
  redis.call('SADD', KEYS[2], ARGV[2])
  redis.call('SADD', KEYS[3], ARGV[1])
else
  redis.call('HDEL', KEYS[1], ARGV[1])
  redis.call('SREM', KEYS[2], ARGV[2])
end
return {before, total()}
"#;

/// KEYS: own liveness key, instances set. ARGV: ttl seconds, instance.
/// Returns 1 if the record still existed.
const KEEP_ALIVE_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('SET', KEYS[1], '1', 'EX', ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return existed
"#;

/// KEYS: dead instance's liveness key, its shares set, instances set.
/// ARGV: dead instance, count key prefix. Returns users left with no share.
const SWEEP_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return {} end
local offline = {}
for _, user in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  local key = ARGV[2] .. user
  local share = tonumber(redis.call('HGET', key, ARGV[1]) or '0')
  redis.call('HDEL', key, ARGV[1])
  if share > 0 and redis.call('HLEN', key) == 0 then
    table.insert(offline, user)
  end
end
redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[3], ARGV[1])
return offline
"#;

enum Control {
    Unsubscribe,
    Shutdown,
}

enum PumpExit {
    Shutdown,
    Unsubscribed,
    Lost(String),
}

/// Key names for one fleet prefix.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn count(&self, user: &UserId) -> String {
        format!("{}{}", self.count_prefix(), user)
    }

    fn count_prefix(&self) -> String {
        format!("{}:presence:count:", self.prefix)
    }

    fn shares(&self, instance: &InstanceId) -> String {
        format!("{}:presence:shares:{}", self.prefix, instance)
    }

    fn alive(&self, instance: &InstanceId) -> String {
        format!("{}:instance:{}:alive", self.prefix, instance)
    }

    fn instances(&self) -> String {
        format!("{}:instances", self.prefix)
    }
}

pub struct RedisFabric {
    keys: Keys,
    instance: InstanceId,
    liveness_ttl: Duration,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    connected: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<Control>,
}

impl RedisFabric {
    /// Connect, subscribe and write the first liveness record. Fails fast
    /// if the broker is unreachable.
    pub async fn connect(
        url: &str,
        prefix: &str,
        instance: InstanceId,
        liveness_ttl: Duration,
        backoff: Backoff,
        inbound: mpsc::Sender<FabricInbound>,
    ) -> RoomcastResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| roomcast_core::RoomcastError::Config(format!("invalid fabric url: {e}")))?;
        let (mut conn, pubsub) = open(&client, prefix).await?;
        let keys = Keys {
            prefix: prefix.to_string(),
        };
        refresh_liveness(&mut conn, &keys, &instance, liveness_ttl).await?;
        info!(prefix = %prefix, instance_id = %instance, "connected to redis fabric");

        let conn = Arc::new(Mutex::new(Some(conn)));
        let connected = Arc::new(AtomicBool::new(true));
        let (control, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(supervise(Supervisor {
            client,
            prefix: prefix.to_string(),
            conn: Arc::clone(&conn),
            connected: Arc::clone(&connected),
            inbound,
            control: control_rx,
            backoff,
            pubsub: Some(pubsub),
        }));

        Ok(Self {
            keys,
            instance,
            liveness_ttl,
            conn,
            connected,
            control,
        })
    }

    fn connection(&self) -> RoomcastResult<MultiplexedConnection> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(unavailable("redis link is down"));
        }
        self.conn
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| unavailable("redis link is down"))
    }
}

async fn refresh_liveness(
    conn: &mut MultiplexedConnection,
    keys: &Keys,
    instance: &InstanceId,
    ttl: Duration,
) -> RoomcastResult<bool> {
    let existed: i64 = redis::cmd("EVAL")
        .arg(KEEP_ALIVE_SCRIPT)
        .arg(2)
        .arg(keys.alive(instance))
        .arg(keys.instances())
        .arg(ttl.as_secs().max(1))
        .arg(instance.as_str())
        .query_async(conn)
        .await
        .map_err(|e| unavailable(format!("liveness refresh: {e}")))?;
    Ok(existed == 1)
}

impl Fabric for RedisFabric {
    fn publish<'a>(&'a self, envelope: &'a FabricEnvelope) -> FabricFuture<'a, ()> {
        Box::pin(async move {
            let channel = envelope.event.channel().name(&self.keys.prefix);
            let payload = codec::encode(envelope)?;
            let mut conn = self.connection()?;
            let receivers: i64 = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&payload)
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("publish to {channel}: {e}")))?;
            debug!(channel = %channel, receivers, "published");
            Ok(())
        })
    }

    fn increment_presence<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let count: i64 = redis::cmd("EVAL")
                .arg(INCREMENT_SCRIPT)
                .arg(3)
                .arg(self.keys.count(user))
                .arg(self.keys.shares(&self.instance))
                .arg(self.keys.instances())
                .arg(self.instance.as_str())
                .arg(user.as_str())
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("presence increment: {e}")))?;
            Ok(count)
        })
    }

    fn decrement_presence<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let count: i64 = redis::cmd("EVAL")
                .arg(DECREMENT_SCRIPT)
                .arg(2)
                .arg(self.keys.count(user))
                .arg(self.keys.shares(&self.instance))
                .arg(self.instance.as_str())
                .arg(user.as_str())
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("presence decrement: {e}")))?;
            Ok(count)
        })
    }

    fn presence_count<'a>(&'a self, user: &'a UserId) -> FabricFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let shares: Vec<i64> = redis::cmd("HVALS")
                .arg(self.keys.count(user))
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("presence lookup: {e}")))?;
            Ok(shares.into_iter().sum::<i64>().max(0))
        })
    }

    fn set_presence_share<'a>(&'a self, user: &'a UserId, share: i64) -> FabricFuture<'a, (i64, i64)> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let totals: (i64, i64) = redis::cmd("EVAL")
                .arg(SET_SHARE_SCRIPT)
                .arg(3)
                .arg(self.keys.count(user))
                .arg(self.keys.shares(&self.instance))
                .arg(self.keys.instances())
                .arg(self.instance.as_str())
                .arg(user.as_str())
                .arg(share.max(0))
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("presence share: {e}")))?;
            Ok(totals)
        })
    }

    fn presence_shares(&self) -> FabricFuture<'_, Vec<UserId>> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let users: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.keys.shares(&self.instance))
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("presence shares: {e}")))?;
            Ok(users.into_iter().map(UserId::from).collect())
        })
    }

    fn keep_alive(&self) -> FabricFuture<'_, bool> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            refresh_liveness(&mut conn, &self.keys, &self.instance, self.liveness_ttl).await
        })
    }

    fn sweep_dead(&self) -> FabricFuture<'_, Vec<UserId>> {
        Box::pin(async move {
            let mut conn = self.connection()?;
            let instances: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.keys.instances())
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(format!("instance list: {e}")))?;

            let mut offline = Vec::new();
            for other in instances {
                let other = InstanceId::from(other);
                if other == self.instance {
                    continue;
                }
                let users: Vec<String> = redis::cmd("EVAL")
                    .arg(SWEEP_SCRIPT)
                    .arg(3)
                    .arg(self.keys.alive(&other))
                    .arg(self.keys.shares(&other))
                    .arg(self.keys.instances())
                    .arg(other.as_str())
                    .arg(self.keys.count_prefix())
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| unavailable(format!("presence sweep: {e}")))?;
                if !users.is_empty() {
                    info!(instance_id = %other, users = users.len(), "swept presence of dead instance");
                }
                offline.extend(users.into_iter().map(UserId::from));
            }
            Ok(offline)
        })
    }

    fn unsubscribe(&self) -> FabricFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.control.send(Control::Unsubscribe);
            Ok(())
        })
    }

    fn close(&self) -> FabricFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.control.send(Control::Shutdown);
            // Leftover shares (decrements lost to an outage) become sweepable
            // right away instead of after the TTL.
            if let Ok(mut conn) = self.connection() {
                let removed: Result<i64, _> = redis::cmd("DEL")
                    .arg(self.keys.alive(&self.instance))
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = removed {
                    warn!(error = %e, "could not remove liveness record");
                }
            }
            self.connected.store(false, Ordering::Release);
            self.conn.lock().unwrap_or_else(|p| p.into_inner()).take();
            info!("redis fabric closed");
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

async fn open(
    client: &redis::Client,
    prefix: &str,
) -> RoomcastResult<(MultiplexedConnection, PubSub)> {
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| unavailable(format!("redis connect: {e}")))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| unavailable(format!("redis pubsub connect: {e}")))?;
    pubsub
        .psubscribe(Channel::room_pattern(prefix))
        .await
        .map_err(|e| unavailable(format!("psubscribe: {e}")))?;
    pubsub
        .subscribe(Channel::Presence.name(prefix))
        .await
        .map_err(|e| unavailable(format!("subscribe: {e}")))?;
    Ok((conn, pubsub))
}

struct Supervisor {
    client: redis::Client,
    prefix: String,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    connected: Arc<AtomicBool>,
    inbound: mpsc::Sender<FabricInbound>,
    control: mpsc::UnboundedReceiver<Control>,
    backoff: Backoff,
    pubsub: Option<PubSub>,
}

impl Supervisor {
    fn mark_down(&self) {
        self.connected.store(false, Ordering::Release);
        self.conn.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    /// Reconnect with backoff. `false` if shutdown arrived first.
    async fn reconnect(&mut self) -> bool {
        loop {
            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                ctl = self.control.recv() => match ctl {
                    Some(Control::Unsubscribe) => continue,
                    Some(Control::Shutdown) | None => return false,
                },
            }
            match open(&self.client, &self.prefix).await {
                Ok((conn, pubsub)) => {
                    *self.conn.lock().unwrap_or_else(|p| p.into_inner()) = Some(conn);
                    self.connected.store(true, Ordering::Release);
                    self.backoff.reset();
                    self.pubsub = Some(pubsub);
                    info!("redis fabric reconnected");
                    let _ = self.inbound.send(FabricInbound::Status(FabricStatus::Up)).await;
                    return true;
                }
                Err(e) => warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "redis reconnect failed"),
            }
        }
    }
}

async fn supervise(mut sup: Supervisor) {
    loop {
        let Some(pubsub) = sup.pubsub.take() else {
            return;
        };
        match pump(pubsub, &sup.prefix, &sup.inbound, &mut sup.control).await {
            PumpExit::Shutdown => {
                debug!("redis subscriber stopped");
                return;
            }
            PumpExit::Unsubscribed => {
                info!("unsubscribed from redis fabric");
                while let Some(ctl) = sup.control.recv().await {
                    if matches!(ctl, Control::Shutdown) {
                        break;
                    }
                }
                return;
            }
            PumpExit::Lost(reason) => {
                warn!(reason = %reason, "redis fabric lost, running local-only");
                sup.mark_down();
                let _ = sup.inbound.send(FabricInbound::Status(FabricStatus::Down)).await;
                if !sup.reconnect().await {
                    return;
                }
            }
        }
    }
}

/// Forward pub/sub messages until the stream ends or control says stop.
/// Dropping the stream drops the subscription.
async fn pump(
    pubsub: PubSub,
    prefix: &str,
    inbound: &mpsc::Sender<FabricInbound>,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> PumpExit {
    let stream = pubsub.into_on_message();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return PumpExit::Lost("subscription stream ended".into());
                };
                let channel = msg.get_channel_name();
                if Channel::parse(prefix, channel).is_none() {
                    continue;
                }
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "non-text payload on fabric");
                        continue;
                    }
                };
                match codec::decode::<FabricEnvelope>(&payload) {
                    Ok(envelope) => {
                        if inbound.send(FabricInbound::Event(envelope)).await.is_err() {
                            return PumpExit::Shutdown;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "undecodable fabric envelope"),
                }
            }
            ctl = control.recv() => match ctl {
                Some(Control::Unsubscribe) => return PumpExit::Unsubscribed,
                Some(Control::Shutdown) | None => return PumpExit::Shutdown,
            },
        }
    }
}
