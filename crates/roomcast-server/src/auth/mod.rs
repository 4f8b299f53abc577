//! Admission control for incoming connections.

pub mod rate_limit;

pub use rate_limit::HandshakeLimiter;
