//! Authentication handshake.
//!
//! Runs inside the WebSocket upgrade callback, before any event is read:
//! 1. Rate-limit the remote IP
//! 2. Extract the identity token (`?token=` or `Authorization: Bearer`)
//! 3. Verify signature, expiry and issuer
//! 4. Bind the resulting user id to the connection for its lifetime
//!
//! Any failure answers the upgrade with an HTTP error, so a rejected client
//! never reaches the registry.

use crate::auth::HandshakeLimiter;
use crate::config::ServerConfig;
use roomcast_core::token::{self, VerifyOptions};
use roomcast_core::{RoomcastError, RoomcastResult, UserId};
use std::net::IpAddr;
use std::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tracing::{debug, warn};

/// Identity bound to a connection at handshake time. Never re-derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    /// Token expiry (seconds since epoch). Informational only: an open
    /// connection outlives its token until it reconnects.
    pub expires_at: u64,
}

/// Verifies identity tokens presented at connection open.
pub struct Authenticator {
    secret: Vec<u8>,
    options: VerifyOptions,
    limiter: Mutex<HandshakeLimiter>,
}

impl Authenticator {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            secret: config.token_secret.clone(),
            options: VerifyOptions {
                issuer: config.issuer.clone(),
                leeway_secs: config.leeway_secs,
            },
            limiter: Mutex::new(HandshakeLimiter::per_minute(
                config.max_handshakes_per_minute,
            )),
        }
    }

    /// Admit or reject an upgrade request from `remote`.
    pub fn authenticate(&self, remote: IpAddr, request: &Request) -> RoomcastResult<Identity> {
        let allowed = self
            .limiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .check(&remote);
        if !allowed {
            warn!(remote = %remote, "handshake rate limited");
            return Err(RoomcastError::RateLimited);
        }

        let token = extract_token(request)
            .ok_or_else(|| RoomcastError::Authentication("missing identity token".into()))?;
        let identity = self.verify_token(&token)?;
        debug!(remote = %remote, user_id = %identity.user_id, "handshake verified");
        Ok(identity)
    }

    /// Verify a bare token.
    pub fn verify_token(&self, token: &str) -> RoomcastResult<Identity> {
        let claims = token::verify(&self.secret, token, &self.options)?;
        Ok(Identity {
            user_id: UserId::from(claims.sub),
            expires_at: claims.exp,
        })
    }

    /// Forget IPs with no recent attempts.
    pub fn gc(&self) {
        self.limiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gc();
    }
}

/// Pull the token from the query string or the `Authorization` header.
pub fn extract_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    });
    if let Some(token) = from_query.filter(|t| !t.is_empty()) {
        return Some(token);
    }

    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// HTTP response refusing the upgrade.
pub fn rejection(err: &RoomcastError) -> ErrorResponse {
    let status = match err {
        RoomcastError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::UNAUTHORIZED,
    };
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}
