//! Sliding-window rate limiter for handshake attempts.
//!
//! Per-key timestamp lists that decay over a rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → attempt timestamps.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;

        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Drop keys with no attempts inside the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;

        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Handshake attempts per remote IP, one-minute window.
#[derive(Debug)]
pub struct HandshakeLimiter {
    inner: RateLimiter,
}

impl HandshakeLimiter {
    pub fn per_minute(max_attempts: u32) -> Self {
        Self {
            inner: RateLimiter::new(max_attempts, Duration::from_secs(60)),
        }
    }

    pub fn check(&mut self, ip: &IpAddr) -> bool {
        self.inner.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.inner.gc();
    }
}
