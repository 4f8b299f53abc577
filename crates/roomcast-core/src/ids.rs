//! Strongly-typed identifiers.
//!
//! Every identifier is a string on the wire; the newtypes keep a room id from
//! being passed where a user id is expected.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Authenticated user identity, bound once at handshake.
    UserId
);
string_id!(
    /// Logical channel shared by two or more users.
    RoomId
);
string_id!(
    /// Instance-local connection handle.
    ConnectionId
);
string_id!(
    /// One process in the fleet.
    InstanceId
);
string_id!(
    /// Identifier of a relayed chat message.
    MessageId
);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(random_hex(12))
    }
}

impl InstanceId {
    pub fn generate() -> Self {
        Self(random_hex(6))
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(random_hex(16))
    }
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Wall-clock time in milliseconds since the UNIX epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock time in whole seconds since the UNIX epoch.
pub fn epoch_secs() -> u64 {
    epoch_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_hex() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 24);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let room = RoomId::from("R1");
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"R1\"");
        let back: RoomId = serde_json::from_str("\"R1\"").unwrap();
        assert_eq!(back, room);
    }
}
