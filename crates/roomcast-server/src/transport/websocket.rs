//! WebSocket listener using tokio-tungstenite.
//!
//! Every accepted TCP stream is upgraded on its own task. The identity token
//! is checked inside the upgrade callback, so a rejected client gets an HTTP
//! error response and never produces a [`WebSocketConnection`].

use crate::handshake::{rejection, Authenticator, Identity};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use roomcast_core::{RoomcastError, RoomcastResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// An authenticated, upgraded connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    pub identity: Identity,
}

/// Stops the accept loop when asked (or dropped).
pub struct ListenerHandle {
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop accepting. Established connections are unaffected.
    pub fn stop(&self) {
        self.task.abort();
        info!(addr = %self.local_addr, "WebSocket listener stopped");
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind and start accepting.
///
/// Returns the listener handle and a receiver yielding authenticated
/// connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    authenticator: Arc<Authenticator>,
) -> RoomcastResult<(ListenerHandle, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RoomcastError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| RoomcastError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    let task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let authenticator = authenticator.clone();
                    tokio::spawn(async move {
                        let Some(conn) = upgrade(stream, addr, &authenticator).await else {
                            return;
                        };
                        if tx.send(conn).await.is_err() {
                            warn!("WebSocket connection channel closed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((ListenerHandle { local_addr, task }, rx))
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    authenticator: &Authenticator,
) -> Option<WebSocketConnection> {
    let mut identity = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match authenticator.authenticate(addr.ip(), request) {
            Ok(id) => {
                identity = Some(id);
                Ok(response)
            }
            Err(e) => {
                warn!(remote = %addr, error = %e, "handshake rejected");
                Err(rejection(&e))
            }
        }
    };

    match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => {
            let identity = identity?;
            debug!(remote = %addr, user_id = %identity.user_id, "WebSocket connection accepted");
            Some(WebSocketConnection {
                ws_stream,
                remote_addr: addr,
                identity,
            })
        }
        Err(e) => {
            debug!(remote = %addr, error = %e, "WebSocket handshake failed");
            None
        }
    }
}

/// Send one text frame.
pub async fn ws_send_text<S>(sink: &mut S, text: String) -> RoomcastResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| RoomcastError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next frame. `None` once the peer has gone away.
pub async fn ws_recv<S>(stream: &mut S) -> Option<RoomcastResult<Message>>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    stream.next().await.map(|frame| {
        frame.map_err(|e| RoomcastError::Transport(format!("WS recv failed: {e}")))
    })
}
