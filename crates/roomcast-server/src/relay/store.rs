//! Persistence and user-directory collaborators.
//!
//! `none` discards writes / knows no names; `http` talks to an external
//! service. Directory answers are cached for a bounded time, and the cache
//! holds at most a configured number of users.

use crate::config::ServerConfig;
use crate::rooms::membership::{endpoint, parse_base, LookupFuture};
use roomcast_core::{MessageId, RoomId, RoomcastError, RoomcastResult, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A message as handed to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: u64,
}

/// Durable write of a sent message.
pub trait MessageStore: Send + Sync {
    fn persist<'a>(&'a self, message: &'a StoredMessage) -> LookupFuture<'a, ()>;
}

/// Display name lookup.
pub trait UserDirectory: Send + Sync {
    fn display_name<'a>(&'a self, user: &'a UserId) -> LookupFuture<'a, Option<String>>;
}

pub struct NoStore;

impl MessageStore for NoStore {
    fn persist<'a>(&'a self, message: &'a StoredMessage) -> LookupFuture<'a, ()> {
        Box::pin(async move {
            debug!(message_id = %message.message_id, "message store disabled, not persisted");
            Ok(())
        })
    }
}

/// `POST {base}/rooms/{room}/messages` with the message as JSON.
pub struct HttpStore {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpStore {
    pub fn new(client: reqwest::Client, base: &str) -> RoomcastResult<Self> {
        Ok(Self {
            client,
            base: parse_base(base)?,
        })
    }
}

impl MessageStore for HttpStore {
    fn persist<'a>(&'a self, message: &'a StoredMessage) -> LookupFuture<'a, ()> {
        Box::pin(async move {
            let url = endpoint(&self.base, &["rooms", message.room_id.as_str(), "messages"])?;
            let resp = self
                .client
                .post(url)
                .json(message)
                .send()
                .await
                .map_err(|e| RoomcastError::Persistence(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(RoomcastError::Persistence(format!(
                    "store returned {}",
                    resp.status()
                )));
            }
            Ok(())
        })
    }
}

pub struct NoDirectory;

impl UserDirectory for NoDirectory {
    fn display_name<'a>(&'a self, _user: &'a UserId) -> LookupFuture<'a, Option<String>> {
        Box::pin(async { Ok(None) })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryEntry {
    display_name: Option<String>,
}

/// `GET {base}/users/{user}` answering `{ "displayName": ... }`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpDirectory {
    pub fn new(client: reqwest::Client, base: &str) -> RoomcastResult<Self> {
        Ok(Self {
            client,
            base: parse_base(base)?,
        })
    }
}

impl UserDirectory for HttpDirectory {
    fn display_name<'a>(&'a self, user: &'a UserId) -> LookupFuture<'a, Option<String>> {
        Box::pin(async move {
            let url = endpoint(&self.base, &["users", user.as_str()])?;
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| RoomcastError::Lookup(format!("directory lookup: {e}")))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                return Err(RoomcastError::Lookup(format!(
                    "directory returned {}",
                    resp.status()
                )));
            }
            let entry: DirectoryEntry = resp
                .json()
                .await
                .map_err(|e| RoomcastError::Lookup(format!("directory body: {e}")))?;
            Ok(entry.display_name)
        })
    }
}

/// Caches successful lookups of an inner directory, misses included.
///
/// Entries expire after `ttl`. When the cache is full, expired entries are
/// dropped first, then the oldest one.
pub struct CachedDirectory {
    inner: Arc<dyn UserDirectory>,
    ttl: Duration,
    capacity: usize,
    cache: Mutex<HashMap<UserId, (Option<String>, Instant)>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn UserDirectory>, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            ttl,
            capacity: capacity.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, user: &UserId) -> Option<Option<String>> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        match cache.get(user) {
            Some((name, at)) if at.elapsed() < self.ttl => Some(name.clone()),
            Some(_) => {
                cache.remove(user);
                None
            }
            None => None,
        }
    }

    fn remember(&self, user: &UserId, name: Option<String>) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if !cache.contains_key(user) && cache.len() >= self.capacity {
            let ttl = self.ttl;
            cache.retain(|_, (_, at)| at.elapsed() < ttl);
            if cache.len() >= self.capacity {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, (_, at))| *at)
                    .map(|(user, _)| user.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(user.clone(), (name, Instant::now()));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl UserDirectory for CachedDirectory {
    fn display_name<'a>(&'a self, user: &'a UserId) -> LookupFuture<'a, Option<String>> {
        Box::pin(async move {
            if let Some(hit) = self.lookup(user) {
                return Ok(hit);
            }
            let name = self.inner.display_name(user).await?;
            self.remember(user, name.clone());
            Ok(name)
        })
    }
}

pub fn store_from_config(
    config: &ServerConfig,
    client: &reqwest::Client,
) -> RoomcastResult<Arc<dyn MessageStore>> {
    let backend = config.collaborators.message_store.as_str();
    let store: Arc<dyn MessageStore> = match backend {
        "none" => Arc::new(NoStore),
        url if url.starts_with("http://") || url.starts_with("https://") => {
            Arc::new(HttpStore::new(client.clone(), url)?)
        }
        other => {
            return Err(RoomcastError::Config(format!(
                "unknown message store: {other}"
            )))
        }
    };
    info!(backend = %backend, "message store configured");
    Ok(store)
}

pub fn directory_from_config(
    config: &ServerConfig,
    client: &reqwest::Client,
) -> RoomcastResult<Arc<dyn UserDirectory>> {
    let backend = config.collaborators.user_directory.as_str();
    let inner: Arc<dyn UserDirectory> = match backend {
        "none" => return Ok(Arc::new(NoDirectory)),
        url if url.starts_with("http://") || url.starts_with("https://") => {
            Arc::new(HttpDirectory::new(client.clone(), url)?)
        }
        other => {
            return Err(RoomcastError::Config(format!(
                "unknown user directory: {other}"
            )))
        }
    };
    info!(backend = %backend, "user directory configured");
    Ok(Arc::new(CachedDirectory::new(
        inner,
        config.directory_cache_ttl,
        config.directory_cache_capacity,
    )))
}
