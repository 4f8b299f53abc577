//! External room-membership store.
//!
//! The authoritative answer to "may user X join room Y" lives outside this
//! service. Three backends: `open` (everyone may join), `static` (table from
//! the config file) and an HTTP lookup.

use crate::config::ServerConfig;
use roomcast_core::{RoomId, RoomcastError, RoomcastResult, UserId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Boxed future returned by collaborator lookups.
pub type LookupFuture<'a, T> = Pin<Box<dyn Future<Output = RoomcastResult<T>> + Send + 'a>>;

/// Answers whether a user belongs to a room.
pub trait MembershipStore: Send + Sync {
    fn is_member<'a>(&'a self, room: &'a RoomId, user: &'a UserId) -> LookupFuture<'a, bool>;
}

/// Every authenticated user may join every room.
pub struct OpenMembership;

impl MembershipStore for OpenMembership {
    fn is_member<'a>(&'a self, _room: &'a RoomId, _user: &'a UserId) -> LookupFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// Fixed room → members table.
#[derive(Debug, Default)]
pub struct StaticMembership {
    rooms: HashMap<RoomId, HashSet<UserId>>,
}

impl StaticMembership {
    pub fn new(table: &HashMap<String, Vec<String>>) -> Self {
        let rooms = table
            .iter()
            .map(|(room, members)| {
                (
                    RoomId::from(room.as_str()),
                    members.iter().map(|m| UserId::from(m.as_str())).collect(),
                )
            })
            .collect();
        Self { rooms }
    }
}

impl MembershipStore for StaticMembership {
    fn is_member<'a>(&'a self, room: &'a RoomId, user: &'a UserId) -> LookupFuture<'a, bool> {
        let member = self
            .rooms
            .get(room)
            .map(|members| members.contains(user))
            .unwrap_or(false);
        Box::pin(async move { Ok(member) })
    }
}

/// `GET {base}/rooms/{room}/members/{user}`: 2xx member, 404 not a member.
pub struct HttpMembership {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpMembership {
    pub fn new(client: reqwest::Client, base: &str) -> RoomcastResult<Self> {
        Ok(Self {
            client,
            base: parse_base(base)?,
        })
    }
}

impl MembershipStore for HttpMembership {
    fn is_member<'a>(&'a self, room: &'a RoomId, user: &'a UserId) -> LookupFuture<'a, bool> {
        Box::pin(async move {
            let url = endpoint(&self.base, &["rooms", room.as_str(), "members", user.as_str()])?;
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| RoomcastError::Lookup(format!("membership lookup: {e}")))?;
            let status = resp.status();
            debug!(room_id = %room, user_id = %user, status = %status, "membership lookup");
            if status.is_success() {
                Ok(true)
            } else if status == reqwest::StatusCode::NOT_FOUND {
                Ok(false)
            } else {
                Err(RoomcastError::Lookup(format!(
                    "membership lookup returned {status}"
                )))
            }
        })
    }
}

/// Build the configured membership backend.
pub fn from_config(
    config: &ServerConfig,
    client: &reqwest::Client,
) -> RoomcastResult<Arc<dyn MembershipStore>> {
    let backend = config.collaborators.membership.as_str();
    let store: Arc<dyn MembershipStore> = match backend {
        "open" => Arc::new(OpenMembership),
        "static" => Arc::new(StaticMembership::new(&config.rooms)),
        url if url.starts_with("http://") || url.starts_with("https://") => {
            Arc::new(HttpMembership::new(client.clone(), url)?)
        }
        other => {
            return Err(RoomcastError::Config(format!(
                "unknown membership backend: {other}"
            )))
        }
    };
    info!(backend = %backend, "membership store configured");
    Ok(store)
}

pub(crate) fn parse_base(base: &str) -> RoomcastResult<reqwest::Url> {
    reqwest::Url::parse(base).map_err(|e| RoomcastError::Config(format!("invalid url {base}: {e}")))
}

/// Append percent-encoded path segments to `base`.
pub(crate) fn endpoint(base: &reqwest::Url, segments: &[&str]) -> RoomcastResult<reqwest::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| RoomcastError::Config(format!("url cannot be a base: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_table_answers_membership() {
        let mut table = HashMap::new();
        table.insert("R1".to_string(), vec!["alice".to_string(), "bob".to_string()]);
        let store = StaticMembership::new(&table);

        assert!(store.is_member(&"R1".into(), &"alice".into()).await.unwrap());
        assert!(!store.is_member(&"R1".into(), &"mallory".into()).await.unwrap());
        assert!(!store.is_member(&"R2".into(), &"alice".into()).await.unwrap());
    }

    #[tokio::test]
    async fn open_store_admits_everyone() {
        assert!(OpenMembership
            .is_member(&"any".into(), &"one".into())
            .await
            .unwrap());
    }

    #[test]
    fn endpoint_encodes_segments() {
        let base = parse_base("http://members.internal/api/").unwrap();
        let url = endpoint(&base, &["rooms", "team/42", "members", "u 1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://members.internal/api/rooms/team%2F42/members/u%201"
        );
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        let mut cfg = crate::config::test_config("i1");
        cfg.collaborators.membership = "ldap".into();
        assert!(from_config(&cfg, &reqwest::Client::new()).is_err());
    }
}
