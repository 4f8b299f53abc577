//! roomcast-core: shared protocol library for roomcast.
//!
//! Provides typed identifiers, client wire events, fabric envelopes, the JSON
//! codec, HS256 identity tokens and the error taxonomy.

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod events;
pub mod ids;
pub mod token;

// Re-export commonly used items at crate root.
pub use broadcast::{BroadcastEvent, Channel, FabricEnvelope};
pub use error::{RoomcastError, RoomcastResult};
pub use events::{ClientEvent, PresenceStatus, ServerEvent};
pub use ids::{epoch_ms, epoch_secs, ConnectionId, InstanceId, MessageId, RoomId, UserId};
