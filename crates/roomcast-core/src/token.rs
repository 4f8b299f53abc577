//! HS256 identity tokens.
//!
//! Compact JWT form: `base64url(header).base64url(claims).base64url(hmac)`.
//! Only verification is used in the connection path; `sign` exists for local
//! tooling and tests.

use crate::error::{RoomcastError, RoomcastResult};
use crate::ids::{epoch_secs, UserId};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Claims carried by an identity token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    /// Expiry, seconds since epoch.
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl Claims {
    /// Claims for `user` expiring `ttl_secs` from now.
    pub fn for_user(user: &UserId, ttl_secs: u64) -> Self {
        let now = epoch_secs();
        Self {
            sub: user.to_string(),
            exp: now + ttl_secs,
            iat: Some(now),
            iss: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// Verification parameters.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Required `iss`, if any.
    pub issuer: Option<String>,
    /// Tolerated clock skew on `exp`.
    pub leeway_secs: u64,
}

/// Sign `claims` with `secret`.
pub fn sign(secret: &[u8], claims: &Claims) -> RoomcastResult<String> {
    let header = URL_SAFE_NO_PAD.encode(HEADER);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{payload}");

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, signing_input.as_bytes());
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
}

/// Verify signature, algorithm, expiry and issuer; return the claims.
pub fn verify(secret: &[u8], token: &str, opts: &VerifyOptions) -> RoomcastResult<Claims> {
    let mut parts = token.splitn(3, '.');
    let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) => (h, p, s),
        _ => return Err(auth_err("malformed token")),
    };

    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| auth_err("malformed signature"))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
    hmac::verify(&key, signing_input.as_bytes(), &signature)
        .map_err(|_| auth_err("invalid token signature"))?;

    let header: Header = URL_SAFE_NO_PAD
        .decode(header_b64)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .ok_or_else(|| auth_err("invalid token header"))?;
    if header.alg != "HS256" {
        return Err(auth_err("unsupported algorithm"));
    }

    let claims: Claims = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .ok_or_else(|| auth_err("invalid token claims"))?;

    if claims.sub.is_empty() {
        return Err(auth_err("empty subject"));
    }
    if epoch_secs() > claims.exp.saturating_add(opts.leeway_secs) {
        return Err(auth_err("token expired"));
    }
    if let Some(expected) = &opts.issuer {
        if claims.iss.as_deref() != Some(expected.as_str()) {
            return Err(auth_err("invalid issuer"));
        }
    }

    Ok(claims)
}

fn auth_err(reason: &str) -> RoomcastError {
    RoomcastError::Authentication(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-test-secret-32-bytes";

    #[test]
    fn sign_and_verify() {
        let claims = Claims::for_user(&UserId::from("u1"), 3600);
        let token = sign(SECRET, &claims).unwrap();
        let back = verify(SECRET, &token, &VerifyOptions::default()).unwrap();
        assert_eq!(back.sub, "u1");
    }

    #[test]
    fn wrong_secret() {
        let token = sign(SECRET, &Claims::for_user(&"u1".into(), 3600)).unwrap();
        let err = verify(b"other", &token, &VerifyOptions::default()).unwrap_err();
        assert!(matches!(err, RoomcastError::Authentication(_)));
    }

    #[test]
    fn expired_token() {
        let claims = Claims {
            sub: "u1".into(),
            exp: epoch_secs() - 120,
            iat: None,
            iss: None,
        };
        let token = sign(SECRET, &claims).unwrap();
        assert!(verify(SECRET, &token, &VerifyOptions::default()).is_err());

        let lenient = VerifyOptions {
            issuer: None,
            leeway_secs: 300,
        };
        assert!(verify(SECRET, &token, &lenient).is_ok());
    }

    #[test]
    fn tampered_claims() {
        let token = sign(SECRET, &Claims::for_user(&"u1".into(), 3600)).unwrap();
        let forged = URL_SAFE_NO_PAD.encode(r#"{"sub":"admin","exp":99999999999}"#);
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert!(verify(SECRET, &tampered, &VerifyOptions::default()).is_err());
    }

    #[test]
    fn issuer_is_enforced() {
        let mut claims = Claims::for_user(&"u1".into(), 3600);
        claims.iss = Some("auth.example".into());
        let token = sign(SECRET, &claims).unwrap();

        let opts = VerifyOptions {
            issuer: Some("auth.example".into()),
            leeway_secs: 0,
        };
        assert!(verify(SECRET, &token, &opts).is_ok());

        let wrong = VerifyOptions {
            issuer: Some("elsewhere".into()),
            leeway_secs: 0,
        };
        assert!(verify(SECRET, &token, &wrong).is_err());
    }

    #[test]
    fn malformed() {
        assert!(verify(SECRET, "abc", &VerifyOptions::default()).is_err());
        assert!(verify(SECRET, "a.b.c", &VerifyOptions::default()).is_err());
    }
}
