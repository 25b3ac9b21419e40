//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*, plus the conventional PORT / JWT_SECRET / CLIENT_URL)
//! - TOML configuration file
//! - `--config <path>` on the command line

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origin allowed to open connections (`*` allows any).
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Credential verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Credential verification configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 signing secret.
    #[serde(default = "default_jwt_secret")]
    pub secret: String,

    /// Clock skew tolerated when checking expiry, in seconds.
    #[serde(default)]
    pub leeway_secs: u64,

    /// Required `iss` claim, if any.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Required `aud` claim, if any.
    #[serde(default)]
    pub audience: Option<String>,
}

// The secret never reaches the logs.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close connections silent for this long, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// First set variable among `names`.
fn env_any(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| std::env::var(name).ok())
}

// Default value functions
fn default_host() -> String {
    env_any(&["RELAY_HOST"]).unwrap_or_else(|| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    env_any(&["RELAY_PORT", "PORT"])
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_allowed_origin() -> String {
    env_any(&["RELAY_ALLOWED_ORIGIN", "CLIENT_URL"]).unwrap_or_else(|| "*".to_string())
}

fn default_jwt_secret() -> String {
    env_any(&["RELAY_JWT_SECRET", "JWT_SECRET"]).unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_max_message_size() -> usize {
    circle_relay_protocol::DEFAULT_MAX_FRAME_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origin: default_allowed_origin(),
            websocket_path: default_ws_path(),
            auth: AuthConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_jwt_secret(),
            leeway_secs: 0,
            issuer: None,
            audience: None,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// the resulting configuration is invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => Self::from_default_paths()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "circle-relay.toml",
            "/etc/circle-relay/circle-relay.toml",
            "~/.config/circle-relay/circle-relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check that the configuration can run a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing secret is missing or the bind address
    /// or WebSocket path is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.auth.secret.trim().is_empty() {
            bail!("No signing secret configured (set RELAY_JWT_SECRET or [auth] secret)");
        }
        if !self.websocket_path.starts_with('/') {
            bail!("websocket_path must start with '/': {}", self.websocket_path);
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be positive");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
