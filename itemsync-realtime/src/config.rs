//! Server configuration: defaults plus `ITEMSYNC_*` environment overrides.

use std::time::Duration;

use crate::auth::DEFAULT_TOKEN_EXPIRY;
use crate::channel::DEFAULT_OUTBOUND_CAPACITY;
use crate::error::{SyncError, SyncResult};

pub const ENV_BIND_ADDR: &str = "ITEMSYNC_BIND_ADDR";
pub const ENV_TOKEN_SECRET: &str = "ITEMSYNC_TOKEN_SECRET";
pub const ENV_TOKEN_EXPIRY_SECS: &str = "ITEMSYNC_TOKEN_EXPIRY_SECS";
pub const ENV_AUTH_TIMEOUT_SECS: &str = "ITEMSYNC_AUTH_TIMEOUT_SECS";
pub const ENV_MAX_CONNECTIONS_PER_USER: &str = "ITEMSYNC_MAX_CONNECTIONS_PER_USER";
pub const ENV_OUTBOUND_CAPACITY: &str = "ITEMSYNC_OUTBOUND_CAPACITY";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// HMAC key for bearer tokens
    pub token_secret: Vec<u8>,
    /// Lifetime of an issued token
    pub token_expiry: Duration,
    /// How long a fresh connection may stay unauthenticated (None = forever)
    pub auth_timeout: Option<Duration>,
    /// Live channels allowed per user (None = unlimited)
    pub max_connections_per_user: Option<usize>,
    /// Frames a channel may have queued before it is dropped as stalled
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            token_secret: b"itemsync-development-secret".to_vec(),
            token_expiry: DEFAULT_TOKEN_EXPIRY,
            auth_timeout: Some(Duration::from_secs(30)),
            max_connections_per_user: Some(32),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by whatever `ITEMSYNC_*` variables are set.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(secret) = lookup(ENV_TOKEN_SECRET) {
            if secret.is_empty() {
                return Err(SyncError::Config(format!("{ENV_TOKEN_SECRET} must not be empty")));
            }
            config.token_secret = secret.into_bytes();
        }
        if let Some(raw) = lookup(ENV_TOKEN_EXPIRY_SECS) {
            let secs = parse_u64(ENV_TOKEN_EXPIRY_SECS, &raw)?;
            if secs == 0 {
                return Err(SyncError::Config(format!("{ENV_TOKEN_EXPIRY_SECS} must be positive")));
            }
            config.token_expiry = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup(ENV_AUTH_TIMEOUT_SECS) {
            config.auth_timeout = match parse_u64(ENV_AUTH_TIMEOUT_SECS, &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        }
        if let Some(raw) = lookup(ENV_MAX_CONNECTIONS_PER_USER) {
            config.max_connections_per_user = match parse_u64(ENV_MAX_CONNECTIONS_PER_USER, &raw)? {
                0 => None,
                n => Some(n as usize),
            };
        }
        if let Some(raw) = lookup(ENV_OUTBOUND_CAPACITY) {
            match parse_u64(ENV_OUTBOUND_CAPACITY, &raw)? {
                0 => {
                    return Err(SyncError::Config(format!("{ENV_OUTBOUND_CAPACITY} must be positive")));
                }
                n => config.outbound_capacity = n as usize,
            }
        }

        Ok(config)
    }
}

fn parse_u64(key: &str, raw: &str) -> SyncResult<u64> {
    raw.trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("{key}={raw:?}: {e}")))
}
