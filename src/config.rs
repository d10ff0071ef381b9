//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HYDRA_TOKEN`, `HYDRA_REMOTE_HOST`,
//!    `HYDRA_REMOTE_PORT`, `HYDRA_POST_URL`, `HYDRA_BASE_URL`, `HYDRA_AGENT_ID`
//! 2. **Config file**: path via `--config <path>`, or `hydra-agent.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [remote]
//! host = "127.0.0.1"
//! port = 8888
//! secure = false                 # wss:// instead of ws://
//! path = "/socket.io/"
//!
//! [forward]
//! post_url = "http://localhost:8888/x"   # target of `predict` commands
//! base_url = "http://localhost:8888"     # prefix for `handle` command paths
//! timeout_ms = 10000
//! fail_on_status = false                 # treat non-2xx as a failed call
//!
//! [keepalive]
//! ping_frequency_ms = 10000              # keepalive period AND retry delay
//!
//! [auth]
//! token = "shared-secret"
//! identity = "per_attempt"               # per_attempt | per_process | fixed
//! # fixed_id = "agent-01"                # required when identity = "fixed"
//! ready_event = "welcome"                # welcome | connect
//! handshake_timeout_ms = 30000           # 0 disables the check
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "hydra-agent.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub keepalive: KeepAliveConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the command endpoint lives.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Hostname or IP of the command endpoint (default `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port (default 8888).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use `wss://` (default false). Certificates are never verified.
    #[serde(default)]
    pub secure: bool,
    /// Socket.IO endpoint path (default `/socket.io/`).
    #[serde(default = "default_socket_path")]
    pub path: String,
}

/// Downstream HTTP service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// Single URL that `predict` payloads are POSTed to.
    #[serde(default = "default_post_url")]
    pub post_url: String,
    /// Base URL that `handle` command paths are appended to.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Timeout for each downstream call in milliseconds (default 10 000).
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    /// Report non-2xx downstream statuses as `success: false` (default false).
    #[serde(default)]
    pub fail_on_status: bool,
}

/// Keepalive settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepAliveConfig {
    /// Milliseconds between pings. Also the fixed delay before every
    /// reconnect attempt (default 10 000).
    #[serde(default = "default_ping_frequency_ms")]
    pub ping_frequency_ms: u64,
}

/// How this agent introduces itself to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Fresh UUID for every handshake attempt.
    PerAttempt,
    /// One UUID generated at startup, reused across reconnects.
    PerProcess,
    /// The configured `fixed_id`.
    Fixed,
}

/// Which inbound signal starts the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyEvent {
    /// The server's `welcome` event.
    Welcome,
    /// The Socket.IO namespace connect packet.
    Connect,
}

/// Authentication and handshake settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared secret sent with `register`. Override with `HYDRA_TOKEN`.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_identity_mode")]
    pub identity: IdentityMode,
    /// Identity used when `identity = "fixed"`. Override with `HYDRA_AGENT_ID`.
    pub fixed_id: Option<String>,
    #[serde(default = "default_ready_event")]
    pub ready_event: ReadyEvent,
    /// Milliseconds to wait for `registered` after `register` (0 = forever).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8888
}
fn default_socket_path() -> String {
    "/socket.io/".to_string()
}
fn default_post_url() -> String {
    "http://localhost:8888/x".to_string()
}
fn default_base_url() -> String {
    "http://localhost:8888".to_string()
}
fn default_http_timeout_ms() -> u64 {
    10_000
}
fn default_ping_frequency_ms() -> u64 {
    10_000
}
fn default_identity_mode() -> IdentityMode {
    IdentityMode::PerAttempt
}
fn default_ready_event() -> ReadyEvent {
    ReadyEvent::Welcome
}
fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secure: false,
            path: default_socket_path(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            post_url: default_post_url(),
            base_url: default_base_url(),
            timeout_ms: default_http_timeout_ms(),
            fail_on_status: false,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            ping_frequency_ms: default_ping_frequency_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            identity: default_identity_mode(),
            fixed_id: None,
            ready_event: default_ready_event(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
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

impl RemoteConfig {
    /// WebSocket URL of the Socket.IO endpoint (Engine.IO protocol 3).
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!(
            "{scheme}://{}:{}{path}?EIO=3&transport=websocket",
            self.host, self.port
        )
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `hydra-agent.toml` in the current directory, falling back to compiled
    /// defaults. The result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides through `lookup` (injected for tests).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(token) = lookup("HYDRA_TOKEN") {
            self.auth.token = token;
        }
        if let Some(host) = lookup("HYDRA_REMOTE_HOST") {
            self.remote.host = host;
        }
        if let Some(port) = lookup("HYDRA_REMOTE_PORT") {
            self.remote.port = port.parse().map_err(|_| ConfigError::Invalid {
                field: "HYDRA_REMOTE_PORT",
                reason: format!("`{port}` is not a port number"),
            })?;
        }
        if let Some(url) = lookup("HYDRA_POST_URL") {
            self.forward.post_url = url;
        }
        if let Some(url) = lookup("HYDRA_BASE_URL") {
            self.forward.base_url = url;
        }
        if let Some(id) = lookup("HYDRA_AGENT_ID") {
            self.auth.identity = IdentityMode::Fixed;
            self.auth.fixed_id = Some(id);
        }
        Ok(())
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.port == 0 {
            return Err(ConfigError::Invalid {
                field: "remote.port",
                reason: "must be non-zero".into(),
            });
        }
        if self.keepalive.ping_frequency_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "keepalive.ping_frequency_ms",
                reason: "must be non-zero".into(),
            });
        }
        if self.forward.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "forward.timeout_ms",
                reason: "must be non-zero".into(),
            });
        }
        for (field, url) in [
            ("forward.post_url", &self.forward.post_url),
            ("forward.base_url", &self.forward.base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("`{url}` is not an http(s) URL"),
                });
            }
        }
        if self.auth.identity == IdentityMode::Fixed
            && self.auth.fixed_id.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Invalid {
                field: "auth.fixed_id",
                reason: "required when auth.identity = \"fixed\"".into(),
            });
        }
        Ok(())
    }

    pub fn ping_frequency(&self) -> Duration {
        Duration::from_millis(self.keepalive.ping_frequency_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.forward.timeout_ms)
    }

    /// `None` when the handshake timeout is disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.auth.handshake_timeout_ms > 0)
            .then(|| Duration::from_millis(self.auth.handshake_timeout_ms))
    }
}
