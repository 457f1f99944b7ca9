//! Relay configuration loaded from environment variables.
//!
//! Everything has a default so a local relay starts with no configuration
//! at all; only `AUTH_TOKENS` must be set for clients to get past the
//! identity check.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_OPERATOR_IDENTITY};
use parley_shared::types::Identity;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// The single support operator.
    /// Env: `OPERATOR_IDENTITY`
    pub operator_identity: Identity,

    /// Bearer tokens and the identities they resolve to.
    /// Env: `AUTH_TOKENS` as `token=identity,token=identity`
    pub auth_tokens: Vec<(String, Identity)>,

    /// Request body cap. Images ride inline, so this sits above the
    /// encoded image limit.
    /// Env: `MAX_BODY_BYTES`
    pub max_body_bytes: usize,

    /// Per-IP token bucket applied to every route.
    /// Env: `RATE_LIMIT_PER_SEC`, `RATE_LIMIT_BURST`
    pub ip_rate_per_sec: f64,
    pub ip_burst: f64,

    /// Per-identity token bucket applied to message sends.
    /// Env: `MESSAGE_RATE_PER_SEC`, `MESSAGE_RATE_BURST`
    pub message_rate_per_sec: f64,
    pub message_burst: f64,

    /// Empty chats younger than this survive maintenance.
    /// Env: `EMPTY_CHAT_GRACE_SECS`
    pub empty_chat_grace: Duration,

    /// How often maintenance runs.
    /// Env: `MAINTENANCE_INTERVAL_SECS`
    pub maintenance_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            operator_identity: Identity::from_email(DEFAULT_OPERATOR_IDENTITY),
            auth_tokens: Vec::new(),
            max_body_bytes: 5 * 1024 * 1024,
            ip_rate_per_sec: 20.0,
            ip_burst: 60.0,
            message_rate_per_sec: 2.0,
            message_burst: 10.0,
            empty_chat_grace: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(operator) = lookup("OPERATOR_IDENTITY") {
            if operator.trim().is_empty() {
                tracing::warn!("Empty OPERATOR_IDENTITY, using default");
            } else {
                config.operator_identity = Identity::from_email(&operator);
            }
        }

        if let Some(raw) = lookup("AUTH_TOKENS") {
            config.auth_tokens = parse_token_table(&raw);
        }

        parse_into(&lookup, "MAX_BODY_BYTES", &mut config.max_body_bytes);
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.ip_rate_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.ip_burst);
        parse_into(&lookup, "MESSAGE_RATE_PER_SEC", &mut config.message_rate_per_sec);
        parse_into(&lookup, "MESSAGE_RATE_BURST", &mut config.message_burst);

        let mut grace = config.empty_chat_grace.as_secs();
        parse_into(&lookup, "EMPTY_CHAT_GRACE_SECS", &mut grace);
        config.empty_chat_grace = Duration::from_secs(grace);

        let mut interval = config.maintenance_interval.as_secs();
        parse_into(&lookup, "MAINTENANCE_INTERVAL_SECS", &mut interval);
        // tokio::time::interval panics on a zero period
        config.maintenance_interval = Duration::from_secs(interval.max(1));

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

/// Parse `token=identity` pairs separated by commas. Malformed entries are
/// skipped with a warning.
fn parse_token_table(raw: &str) -> Vec<(String, Identity)> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((token, identity)) if !token.trim().is_empty() && !identity.trim().is_empty() => {
                Some((token.trim().to_string(), Identity::from_email(identity)))
            }
            _ => {
                tracing::warn!("Skipping malformed AUTH_TOKENS entry");
                None
            }
        })
        .collect()
}
