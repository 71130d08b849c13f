//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `BACKHAUL_TOKEN`, `BACKHAUL_LISTEN`,
//!    `BACKHAUL_TUNNEL_PATH`, `PORT`, `BACKHAUL_RELAY_URL`, `BACKHAUL_TARGET`
//! 2. **Config file**: path via `--config <path>`, or `backhaul.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [tunnel]
//! token = "shared-secret"
//! path = "/my-unguessable-control-path"
//! auth_timeout_secs = 10
//! max_frame_bytes = 16777216
//! outbound_buffer = 256
//!
//! [logging]
//! level = "info"
//!
//! # Only read by `backhaul connect`
//! [client]
//! relay_url = "wss://relay.example.com/my-unguessable-control-path"
//! target = "http://127.0.0.1:3000"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! chunk_size = 4096
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::tunnel::frame::{DEFAULT_MAX_FRAME_BYTES, MAX_ID_LEN};

/// Token value that triggers a startup warning.
pub const DEFAULT_TOKEN: &str = "change-me";

const DEFAULT_CONFIG_FILE: &str = "backhaul.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Public listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Control connection settings, shared by both ends of the tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Shared secret the client sends in its `auth` message.
    /// Override with `BACKHAUL_TOKEN`.
    #[serde(default = "default_token")]
    pub token: String,
    /// Path of the control WebSocket. Requests to any other path are
    /// forwarded through the tunnel.
    #[serde(default = "default_tunnel_path")]
    pub path: String,
    /// Seconds a new control connection has to authenticate (default 10).
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// Largest chunk frame accepted, id and payload together (default 16 MiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Capacity of the outbound queue to the control connection (default 256).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Settings for `backhaul connect`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Full control URL of the relay, e.g. `wss://relay.example.com/<path>`.
    pub relay_url: Option<String>,
    /// Base URL of the local backend (default `http://127.0.0.1:3000`).
    #[serde(default = "default_target")]
    pub target: String,
    /// Seconds before the first reconnect attempt (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Cap on the reconnect backoff (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Largest response body chunk sent per frame (default 4096).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_token() -> String {
    DEFAULT_TOKEN.to_string()
}
fn default_tunnel_path() -> String {
    "/c97ad31f9fc13ff4e6bd022e74dd561ce93cf67e624dc061d461c1226e70".to_string()
}
fn default_auth_timeout() -> u64 {
    10
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_target() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_chunk_size() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
            path: default_tunnel_path(),
            auth_timeout_secs: default_auth_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            target: default_target(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `backhaul.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse TOML text. `origin` only labels errors.
    pub fn parse(origin: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("BACKHAUL_TOKEN") {
            self.tunnel.token = token;
        }
        if let Some(port) = lookup("PORT") {
            self.server.listen = format!("0.0.0.0:{port}");
        }
        if let Some(listen) = lookup("BACKHAUL_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(path) = lookup("BACKHAUL_TUNNEL_PATH") {
            self.tunnel.path = path;
        }
        if let Some(url) = lookup("BACKHAUL_RELAY_URL") {
            self.client.relay_url = Some(url);
        }
        if let Some(target) = lookup("BACKHAUL_TARGET") {
            self.client.target = target;
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let path = &self.tunnel.path;
        if !path.starts_with('/') || path.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "tunnel.path must start with '/' and name a path, got {path:?}"
            )));
        }
        if !path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(ConfigError::Invalid(format!(
                "tunnel.path may only contain letters, digits, '-', '_', '.' and '/', got {path:?}"
            )));
        }
        if self.tunnel.token.is_empty() {
            return Err(ConfigError::Invalid("tunnel.token must not be empty".into()));
        }
        if self.tunnel.max_frame_bytes <= MAX_ID_LEN {
            return Err(ConfigError::Invalid(format!(
                "tunnel.max_frame_bytes must exceed {MAX_ID_LEN} bytes"
            )));
        }
        if self.tunnel.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("tunnel.outbound_buffer must be at least 1".into()));
        }
        if self.client.chunk_size == 0 {
            return Err(ConfigError::Invalid("client.chunk_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn uses_default_token(&self) -> bool {
        self.tunnel.token == DEFAULT_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.tunnel.auth_timeout_secs, 10);
        assert_eq!(config.tunnel.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.client.chunk_size, 4096);
        assert!(config.client.relay_url.is_none());
        assert!(config.uses_default_token());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse(
            "test.toml",
            r#"
            [tunnel]
            token = "s3cret"
            path = "/ctl"

            [client]
            relay_url = "ws://relay:8080/ctl"
            "#,
        )
        .unwrap();
        assert_eq!(config.tunnel.token, "s3cret");
        assert_eq!(config.tunnel.path, "/ctl");
        assert_eq!(config.tunnel.outbound_buffer, 256);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.client.relay_url.as_deref(), Some("ws://relay:8080/ctl"));
        assert!(!config.uses_default_token());
    }

    #[test]
    fn test_parse_error_names_origin() {
        let err = Config::parse("bad.toml", "[tunnel\n").unwrap_err();
        assert!(err.to_string().contains("bad.toml"), "{err}");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BACKHAUL_TOKEN", "from-env"),
            ("PORT", "9000"),
            ("BACKHAUL_TUNNEL_PATH", "/env-path"),
            ("BACKHAUL_TARGET", "http://backend:5000"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(ToString::to_string));
        assert_eq!(config.tunnel.token, "from-env");
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.tunnel.path, "/env-path");
        assert_eq!(config.client.target, "http://backend:5000");
    }

    #[test]
    fn test_listen_beats_port() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "PORT" => Some("9000".into()),
            "BACKHAUL_LISTEN" => Some("127.0.0.1:7000".into()),
            _ => None,
        });
        assert_eq!(config.server.listen, "127.0.0.1:7000");
    }

    #[test]
    fn test_validate_rejects_bad_path() {
        for path in ["", "/", "ctl", "/ctl?x", "/a b"] {
            let mut config = Config::default();
            config.tunnel.path = path.to_string();
            assert!(config.validate().is_err(), "{path:?} should be rejected");
        }
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.client.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.max_frame_bytes = 12;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.token = String::new();
        assert!(config.validate().is_err());
    }
}
