use thiserror::Error;

/// Errors produced across roomcast.
#[derive(Debug, Error)]
pub enum RoomcastError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("membership error: {0}")]
    Membership(String),

    #[error("fabric unavailable: {0}")]
    FabricUnavailable(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("rate limited")]
    RateLimited,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RoomcastError {
    fn from(e: serde_json::Error) -> Self {
        RoomcastError::Codec(e.to_string())
    }
}

impl RoomcastError {
    /// Short machine-readable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            RoomcastError::Authentication(_) => "authentication",
            RoomcastError::Membership(_) => "membership",
            RoomcastError::FabricUnavailable(_) => "fabric_unavailable",
            RoomcastError::Persistence(_) => "persistence_failed",
            RoomcastError::InvalidEvent(_) | RoomcastError::Codec(_) => "invalid_event",
            RoomcastError::InvalidContent(_) => "invalid_content",
            RoomcastError::Lookup(_) | RoomcastError::Timeout => "lookup_failed",
            RoomcastError::RateLimited => "rate_limited",
            _ => "internal",
        }
    }
}

pub type RoomcastResult<T> = Result<T, RoomcastError>;
