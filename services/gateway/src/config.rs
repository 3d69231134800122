//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/souk/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `core.mms_key` (upload URLs cannot be authenticated without it)
//!
//! Everything else has defaults.  A non-positive `redis.max_pipeline_size`
//! or a malformed sentinel address aborts startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use souk_redis::facade::FacadeConfig;
use souk_redis::session::SessionConfig;

use crate::channel::ChannelConfig;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub tls: Option<TlsConfig>,
    pub core: CoreConfig,
    pub channel: ChannelConfig,
    pub timeouts: TimeoutConfig,
    pub redis: FacadeConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address; every worker process binds it with `SO_REUSEPORT`.
    pub bind: String,
    /// TCP backlog.
    pub backlog: u32,
    /// Value of the `Server` header on handshake responses.
    pub server_name: String,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Posts replayed to a session on subscribe, at most.
    pub max_posts_on_sub: usize,
    /// Length of generated registration passwords.
    pub pwd_size: usize,
    /// Publishes allowed per quota window.
    pub allowed_posts: i64,
    /// Quota window length in seconds.
    pub post_interval: i64,
    /// Shared key authenticating upload filenames for the image server.
    pub mms_key: String,
    /// Host serving images, e.g. `https://img.example.com`.
    pub mms_host: String,
    /// Upload URLs handed out per `filenames` request.
    pub filenames_count: usize,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub handshake: Duration,
    pub idle: Duration,
    /// Pongs tolerated before an unauthenticated session is kicked.
    pub login_grace_pongs: u32,
    /// Maximum inbound WebSocket message size.
    pub max_frame_bytes: usize,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServer>,
    tls: Option<RawTls>,
    core: Option<RawCore>,
    channel: Option<RawChannel>,
    timeouts: Option<RawTimeouts>,
    redis: Option<RawRedis>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    bind: Option<String>,
    backlog: Option<u32>,
    server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTls {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCore {
    max_posts_on_sub: Option<usize>,
    pwd_size: Option<usize>,
    allowed_posts: Option<i64>,
    post_interval_secs: Option<i64>,
    mms_key: Option<String>,
    mms_host: Option<String>,
    filenames_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    cleanup_rate: Option<usize>,
    max_posts: Option<usize>,
    post_expiration_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    handshake_secs: Option<u64>,
    idle_secs: Option<u64>,
    login_grace_pongs: Option<u32>,
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRedis {
    host: Option<String>,
    port: Option<u16>,
    sentinels: Option<Vec<String>>,
    master_name: Option<String>,
    conn_retry_ms: Option<u64>,
    max_pipeline_size: Option<i64>,
    keyspace_db: Option<u32>,
    posts_key: Option<String>,
    posts_channel: Option<String>,
    post_id_key: Option<String>,
    user_id_key: Option<String>,
    user_data_prefix: Option<String>,
    chat_msg_prefix: Option<String>,
    presence_prefix: Option<String>,
    tokens_channel: Option<String>,
    chat_msgs_counter_key: Option<String>,
    chat_msg_expiry_secs: Option<i64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/souk/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/souk/gateway.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let server = match raw.server {
        Some(s) => ServerConfig {
            bind: s.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            backlog: s.backlog.unwrap_or(511),
            server_name: s.server_name.unwrap_or_else(|| "souk-gateway".to_owned()),
        },
        None => ServerConfig {
            bind: "0.0.0.0:8080".to_owned(),
            backlog: 511,
            server_name: "souk-gateway".to_owned(),
        },
    };

    let tls = match raw.tls {
        Some(t) => {
            let cert_file = t
                .cert_file
                .ok_or_else(|| ConfigError::MissingField("tls.cert_file".to_owned()))?;
            let key_file = t
                .key_file
                .ok_or_else(|| ConfigError::MissingField("tls.key_file".to_owned()))?;
            Some(TlsConfig {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
            })
        }
        None => None,
    };

    let raw_core = raw
        .core
        .ok_or_else(|| ConfigError::MissingField("core".to_owned()))?;
    let mms_key = raw_core
        .mms_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ConfigError::MissingField("core.mms_key".to_owned()))?;
    let core = CoreConfig {
        max_posts_on_sub: raw_core.max_posts_on_sub.unwrap_or(50),
        pwd_size: raw_core.pwd_size.unwrap_or(10),
        allowed_posts: raw_core.allowed_posts.unwrap_or(3),
        post_interval: raw_core.post_interval_secs.unwrap_or(100_000),
        mms_key,
        mms_host: raw_core
            .mms_host
            .unwrap_or_else(|| "http://127.0.0.1:9000".to_owned()),
        filenames_count: raw_core.filenames_count.unwrap_or(5),
    };

    let channel = match raw.channel {
        Some(c) => ChannelConfig {
            cleanup_rate: c.cleanup_rate.unwrap_or(1000),
            max_posts: c.max_posts.unwrap_or(10_000),
            post_expiration: c.post_expiration_secs.unwrap_or(2_592_000),
        },
        None => ChannelConfig {
            cleanup_rate: 1000,
            max_posts: 10_000,
            post_expiration: 2_592_000,
        },
    };

    let timeouts = match raw.timeouts {
        Some(t) => TimeoutConfig {
            handshake: Duration::from_secs(t.handshake_secs.unwrap_or(30)),
            idle: Duration::from_secs(t.idle_secs.unwrap_or(300)),
            login_grace_pongs: t.login_grace_pongs.unwrap_or(2),
            max_frame_bytes: t.max_frame_bytes.unwrap_or(1 << 20),
        },
        None => TimeoutConfig {
            handshake: Duration::from_secs(30),
            idle: Duration::from_secs(300),
            login_grace_pongs: 2,
            max_frame_bytes: 1 << 20,
        },
    };

    let redis = build_redis(raw.redis)?;

    Ok(GatewayConfig {
        schema_version,
        server,
        tls,
        core,
        channel,
        timeouts,
        redis,
    })
}

fn build_redis(raw: Option<RawRedis>) -> Result<FacadeConfig, ConfigError> {
    let defaults = FacadeConfig::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let max_pipeline_size = raw.max_pipeline_size.unwrap_or(10_000);
    if max_pipeline_size < 1 {
        return Err(ConfigError::InvalidValue(format!(
            "redis.max_pipeline_size must be positive, got {max_pipeline_size}"
        )));
    }
    let sentinels = raw.sentinels.unwrap_or_default();
    for sentinel in &sentinels {
        if !sentinel.contains(':') {
            return Err(ConfigError::InvalidValue(format!(
                "redis.sentinels entry '{sentinel}' is not host:port"
            )));
        }
    }

    let session = SessionConfig {
        host: raw.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
        port: raw.port.unwrap_or(6379),
        sentinels,
        master_name: raw.master_name.unwrap_or_else(|| "mymaster".to_owned()),
        conn_retry_interval: Duration::from_millis(raw.conn_retry_ms.unwrap_or(500)),
        max_pipeline_size: max_pipeline_size as usize,
    };

    Ok(FacadeConfig {
        session,
        posts_key: raw.posts_key.unwrap_or(defaults.posts_key),
        posts_channel: raw.posts_channel.unwrap_or(defaults.posts_channel),
        post_id_key: raw.post_id_key.unwrap_or(defaults.post_id_key),
        user_id_key: raw.user_id_key.unwrap_or(defaults.user_id_key),
        user_data_prefix: raw.user_data_prefix.unwrap_or(defaults.user_data_prefix),
        chat_msg_prefix: raw.chat_msg_prefix.unwrap_or(defaults.chat_msg_prefix),
        presence_prefix: raw.presence_prefix.unwrap_or(defaults.presence_prefix),
        tokens_channel: raw.tokens_channel.unwrap_or(defaults.tokens_channel),
        chat_msgs_counter_key: raw
            .chat_msgs_counter_key
            .unwrap_or(defaults.chat_msgs_counter_key),
        chat_msg_expiry: raw.chat_msg_expiry_secs.unwrap_or(defaults.chat_msg_expiry),
        keyspace_db: raw.keyspace_db.unwrap_or(defaults.keyspace_db),
    })
}
