pub mod websocket;

pub use websocket::{start_listener, ListenerHandle, WebSocketConnection};
