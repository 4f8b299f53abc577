//! Per-connection session loop.
//!
//! The loop owns the socket: it writes outbound events and pings and reads
//! frames. Text frames are handed to a per-connection worker that handles
//! them in arrival order, so a slow lookup never holds up writes or the
//! heartbeat.

use super::Heartbeat;
use crate::instance::Instance;
use crate::registry::{CloseReason, Outbound};
use crate::transport::websocket::{ws_recv, ws_send_text};
use crate::transport::WebSocketConnection;
use futures_util::{SinkExt, StreamExt};
use roomcast_core::{codec, ConnectionId, RoomcastError};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Text frames a connection may have waiting behind its handler.
const INBOUND_BACKLOG: usize = 32;

/// Drive one connection until it closes, then clean it up.
pub async fn run(instance: Arc<Instance>, conn: WebSocketConnection, heartbeat: Heartbeat) {
    let WebSocketConnection {
        ws_stream,
        remote_addr,
        identity,
    } = conn;
    let (mut sink, mut stream) = ws_stream.split();

    let (conn_id, mut outbound) = match instance.connect(&identity).await {
        Ok(pair) => pair,
        Err(e) => {
            info!(remote = %remote_addr, error = %e, "connection refused");
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "instance is draining".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    };
    info!(conn_id = %conn_id, user_id = %identity.user_id, remote = %remote_addr, "session started");

    let mut ping = tokio::time::interval(heartbeat.interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    let mut last_seen = Instant::now();

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
    let worker = tokio::spawn(handle_inbound(instance.clone(), conn_id.clone(), inbound_rx));

    let reason = loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Event(event)) => {
                    let text = match codec::encode(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(conn_id = %conn_id, error = %e, "unencodable event dropped");
                            continue;
                        }
                    };
                    if let Err(e) = ws_send_text(&mut sink, text).await {
                        debug!(conn_id = %conn_id, error = %e, "send failed");
                        break "send failed";
                    }
                }
                Some(Outbound::Close(CloseReason::Shutdown)) => {
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: "server shutting down".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break "shutdown";
                }
                None => break "queue closed",
            },
            frame = ws_recv(&mut stream) => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    match inbound_tx.try_send(text) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(conn_id = %conn_id, backlog = INBOUND_BACKLOG, "inbound backlog full, frame dropped");
                            instance.reject(&conn_id, &RoomcastError::RateLimited, None).await;
                        }
                        Err(TrySendError::Closed(_)) => break "handler stopped",
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    last_seen = Instant::now();
                    instance.registry.touch(&conn_id).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    last_seen = Instant::now();
                    let err = RoomcastError::InvalidEvent("binary frames are not supported".into());
                    instance.reject(&conn_id, &err, None).await;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break "closed by peer",
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, error = %e, "receive failed");
                    break "receive failed";
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > heartbeat.timeout {
                    warn!(conn_id = %conn_id, silent_ms = last_seen.elapsed().as_millis() as u64, "heartbeat timeout");
                    break "heartbeat timeout";
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "send failed";
                }
            }
        }
    };

    debug!(conn_id = %conn_id, reason, "session ended");
    drop(inbound_tx);
    worker.abort();
    let _ = worker.await;
    instance.disconnect(&conn_id).await;
}

/// Handle a connection's text frames one at a time, in order.
async fn handle_inbound(instance: Arc<Instance>, conn_id: ConnectionId, mut frames: mpsc::Receiver<String>) {
    while let Some(text) = frames.recv().await {
        instance.handle_text(&conn_id, &text).await;
    }
}
