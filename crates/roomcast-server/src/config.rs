//! Server configuration: TOML file + CLI overrides.

use roomcast_core::{InstanceId, RoomcastError, RoomcastResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Shortest liveness TTL accepted; the record is refreshed at a third of it.
const MIN_LIVENESS_TTL_SECS: u64 = 3;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub fabric: FabricSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub typing: TypingSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub drain: DrainSection,
    #[serde(default)]
    pub collaborators: CollaboratorsSection,
    /// Static room membership: room id → member user ids.
    #[serde(default)]
    pub rooms: HashMap<String, Vec<String>>,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            instance_id: None,
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[fabric]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FabricSection {
    #[serde(default = "default_fabric_url")]
    pub url: String,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Lifetime of this instance's liveness record. Peers sweep the
    /// presence shares of an instance whose record has lapsed.
    #[serde(default = "default_liveness_ttl")]
    pub liveness_ttl_secs: u64,
}

impl Default for FabricSection {
    fn default() -> Self {
        Self {
            url: default_fabric_url(),
            channel_prefix: default_channel_prefix(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            liveness_ttl_secs: default_liveness_ttl(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub leeway_secs: u64,
    #[serde(default = "default_max_handshakes")]
    pub max_handshakes_per_minute: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_secret: None,
            issuer: None,
            leeway_secs: 0,
            max_handshakes_per_minute: default_max_handshakes(),
        }
    }
}

/// `[heartbeat]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

/// `[typing]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingSection {
    #[serde(default = "default_typing_timeout")]
    pub timeout_ms: u64,
}

impl Default for TypingSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_typing_timeout(),
        }
    }
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_max_content")]
    pub max_content_bytes: usize,
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
    #[serde(default = "default_directory_cache_ttl")]
    pub directory_cache_ttl_secs: u64,
    #[serde(default = "default_directory_cache_capacity")]
    pub directory_cache_capacity: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content(),
            lookup_timeout_ms: default_lookup_timeout(),
            directory_cache_ttl_secs: default_directory_cache_ttl(),
            directory_cache_capacity: default_directory_cache_capacity(),
        }
    }
}

/// `[drain]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainSection {
    #[serde(default = "default_drain_grace")]
    pub grace_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub timeout_secs: u64,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            grace_secs: default_drain_grace(),
            timeout_secs: default_drain_timeout(),
        }
    }
}

/// `[collaborators]` section: where external lookups go.
///
/// `membership` is `"open"`, `"static"` (uses `[rooms]`) or an http(s) base URL.
/// `message_store` and `user_directory` are `"none"` or an http(s) base URL.
#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorsSection {
    #[serde(default = "default_membership")]
    pub membership: String,
    #[serde(default = "default_none")]
    pub message_store: String,
    #[serde(default = "default_none")]
    pub user_directory: String,
}

impl Default for CollaboratorsSection {
    fn default() -> Self {
        Self {
            membership: default_membership(),
            message_store: default_none(),
            user_directory: default_none(),
        }
    }
}

fn default_port() -> u16 {
    4480
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_outbound_queue() -> usize {
    256
}
fn default_fabric_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_channel_prefix() -> String {
    "roomcast".to_string()
}
fn default_reconnect_min_ms() -> u64 {
    250
}
fn default_reconnect_max_ms() -> u64 {
    10_000
}
fn default_liveness_ttl() -> u64 {
    30
}
fn default_max_handshakes() -> u32 {
    20
}
fn default_heartbeat_interval() -> u64 {
    25
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_typing_timeout() -> u64 {
    2000
}
fn default_max_content() -> usize {
    8 * 1024
}
fn default_lookup_timeout() -> u64 {
    3000
}
fn default_directory_cache_ttl() -> u64 {
    300
}
fn default_directory_cache_capacity() -> usize {
    10_000
}
fn default_drain_grace() -> u64 {
    5
}
fn default_drain_timeout() -> u64 {
    30
}
fn default_membership() -> String {
    "static".to_string()
}
fn default_none() -> String {
    "none".to_string()
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub instance_id: Option<String>,
    pub fabric_url: Option<String>,
    pub token_secret: Option<String>,
    pub heartbeat_interval: Option<u64>,
    pub heartbeat_timeout: Option<u64>,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub instance_id: InstanceId,
    pub outbound_queue: usize,
    pub fabric_url: String,
    pub channel_prefix: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub liveness_ttl: Duration,
    pub token_secret: Vec<u8>,
    pub issuer: Option<String>,
    pub leeway_secs: u64,
    pub max_handshakes_per_minute: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub typing_timeout: Duration,
    pub max_content_bytes: usize,
    pub lookup_timeout: Duration,
    pub directory_cache_ttl: Duration,
    pub directory_cache_capacity: usize,
    pub drain_grace: Duration,
    pub drain_timeout: Duration,
    pub collaborators: CollaboratorsSection,
    pub rooms: HashMap<String, Vec<String>>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> RoomcastResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RoomcastError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> RoomcastResult<Self> {
        let token_secret = overrides
            .token_secret
            .or(file.auth.token_secret)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RoomcastError::Config("auth.token_secret is required".into()))?;

        let heartbeat_interval = overrides
            .heartbeat_interval
            .unwrap_or(file.heartbeat.interval_secs);
        let heartbeat_timeout = overrides
            .heartbeat_timeout
            .unwrap_or(file.heartbeat.timeout_secs);
        if heartbeat_interval == 0 || heartbeat_timeout <= heartbeat_interval {
            return Err(RoomcastError::Config(format!(
                "heartbeat timeout ({heartbeat_timeout}s) must exceed a non-zero interval ({heartbeat_interval}s)"
            )));
        }

        let instance_id = overrides
            .instance_id
            .or(file.server.instance_id)
            .map(InstanceId::from)
            .unwrap_or_else(InstanceId::generate);

        Ok(Self {
            port: overrides.port.unwrap_or(file.server.port),
            bind: overrides.bind.unwrap_or(file.server.bind),
            instance_id,
            outbound_queue: file.server.outbound_queue.max(1),
            fabric_url: overrides.fabric_url.unwrap_or(file.fabric.url),
            channel_prefix: file.fabric.channel_prefix,
            reconnect_min: Duration::from_millis(file.fabric.reconnect_min_ms),
            reconnect_max: Duration::from_millis(
                file.fabric.reconnect_max_ms.max(file.fabric.reconnect_min_ms),
            ),
            liveness_ttl: Duration::from_secs(file.fabric.liveness_ttl_secs.max(MIN_LIVENESS_TTL_SECS)),
            token_secret: token_secret.into_bytes(),
            issuer: file.auth.issuer,
            leeway_secs: file.auth.leeway_secs,
            max_handshakes_per_minute: file.auth.max_handshakes_per_minute,
            heartbeat_interval: Duration::from_secs(heartbeat_interval),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout),
            typing_timeout: Duration::from_millis(file.typing.timeout_ms),
            max_content_bytes: file.relay.max_content_bytes,
            lookup_timeout: Duration::from_millis(file.relay.lookup_timeout_ms),
            directory_cache_ttl: Duration::from_secs(file.relay.directory_cache_ttl_secs),
            directory_cache_capacity: file.relay.directory_cache_capacity.max(1),
            drain_grace: Duration::from_secs(file.drain.grace_secs),
            drain_timeout: Duration::from_secs(file.drain.timeout_secs),
            collaborators: file.collaborators,
            rooms: file.rooms,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
pub(crate) fn test_config(instance: &str) -> ServerConfig {
    let overrides = Overrides {
        instance_id: Some(instance.to_string()),
        fabric_url: Some("memory://".into()),
        token_secret: Some("test-secret".into()),
        ..Overrides::default()
    };
    let mut cfg = ServerConfig::resolve(ConfigFile::default(), overrides).unwrap();
    cfg.typing_timeout = Duration::from_millis(80);
    cfg.drain_grace = Duration::from_millis(200);
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        port = 9000
        instance_id = "edge-1"

        [fabric]
        url = "redis://cache:6379"
        channel_prefix = "chat"

        [auth]
        token_secret = "from-file"
        issuer = "auth.example"

        [collaborators]
        membership = "static"

        [rooms]
        R1 = ["alice", "bob"]
    "#;

    #[test]
    fn file_values_are_used() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let cfg = ServerConfig::resolve(file, Overrides::default()).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.instance_id.as_str(), "edge-1");
        assert_eq!(cfg.fabric_url, "redis://cache:6379");
        assert_eq!(cfg.channel_prefix, "chat");
        assert_eq!(cfg.token_secret, b"from-file");
        assert_eq!(cfg.issuer.as_deref(), Some("auth.example"));
        assert_eq!(cfg.rooms["R1"], vec!["alice", "bob"]);
        assert_eq!(cfg.typing_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.liveness_ttl, Duration::from_secs(30));
        assert_eq!(cfg.directory_cache_capacity, 10_000);
    }

    #[test]
    fn liveness_ttl_has_a_floor() {
        let file: ConfigFile = toml::from_str(
            r#"
            [auth]
            token_secret = "s"
            [fabric]
            liveness_ttl_secs = 1
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, Overrides::default()).unwrap();
        assert_eq!(cfg.liveness_ttl, Duration::from_secs(MIN_LIVENESS_TTL_SECS));
    }

    #[test]
    fn cli_overrides_win() {
        let file: ConfigFile = toml::from_str(SAMPLE).unwrap();
        let overrides = Overrides {
            port: Some(7000),
            token_secret: Some("from-cli".into()),
            fabric_url: Some("memory://".into()),
            ..Overrides::default()
        };
        let cfg = ServerConfig::resolve(file, overrides).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.token_secret, b"from-cli");
        assert_eq!(cfg.fabric_url, "memory://");
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = ServerConfig::resolve(ConfigFile::default(), Overrides::default()).unwrap_err();
        assert!(matches!(err, RoomcastError::Config(_)));
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let overrides = Overrides {
            token_secret: Some("s".into()),
            heartbeat_interval: Some(30),
            heartbeat_timeout: Some(30),
            ..Overrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), overrides).is_err());
    }

    #[test]
    fn instance_id_is_generated_when_absent() {
        let overrides = Overrides {
            token_secret: Some("s".into()),
            ..Overrides::default()
        };
        let cfg = ServerConfig::resolve(ConfigFile::default(), overrides).unwrap();
        assert!(!cfg.instance_id.is_empty());
    }
}
