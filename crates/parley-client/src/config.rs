//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_OPERATOR_IDENTITY};
use parley_shared::types::Identity;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL.
    /// Env: `PARLEY_SERVER_URL`
    pub server_url: String,

    /// Bearer token issued for this device's identity.
    /// Env: `PARLEY_TOKEN`
    pub token: String,

    /// Env: `PARLEY_OPERATOR_IDENTITY`
    pub operator_identity: Identity,

    /// Directory holding the device's private key.
    /// Env: `PARLEY_KEY_DIR`
    /// Default: the platform data directory.
    pub key_dir: PathBuf,

    /// Upper bound on every relay and directory call.
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long an error banner stays up.
    pub error_ttl: Duration,
    /// The operator counts as present when the last heartbeat is this fresh.
    pub presence_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"),
            token: String::new(),
            operator_identity: Identity::from_email(DEFAULT_OPERATOR_IDENTITY),
            key_dir: default_key_dir(),
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            error_ttl: Duration::from_secs(4),
            presence_window: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PARLEY_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(token) = std::env::var("PARLEY_TOKEN") {
            config.token = token;
        }
        if let Ok(operator) = std::env::var("PARLEY_OPERATOR_IDENTITY") {
            if !operator.trim().is_empty() {
                config.operator_identity = Identity::from_email(&operator);
            }
        }
        if let Ok(dir) = std::env::var("PARLEY_KEY_DIR") {
            config.key_dir = PathBuf::from(dir);
        }

        config
    }
}

fn default_key_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "parley", "parley")
        .map(|dirs| dirs.data_local_dir().join("keys"))
        .unwrap_or_else(|| PathBuf::from(".parley/keys"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.error_ttl, Duration::from_secs(4));
        assert_eq!(config.presence_window, Duration::from_secs(10));
        assert!(config.key_dir.ends_with("keys"));
    }
}
