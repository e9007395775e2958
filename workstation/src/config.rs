//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TIFLISD_AUTH_KEY`, `TIFLISD_LISTEN`,
//!    `TIFLISD_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `tiflisd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:7433"
//! name = "devbox"
//! max_sessions = 20
//! terminal_buffer_size = 1000
//! data_dir = "/var/lib/tiflisd"
//! workspaces_root = "~/workspaces"
//!
//! [auth]
//! auth_key = "your-secret-key"
//!
//! [agents]
//! default_agent = "claude"
//! hidden_base_types = ["opencode"]
//! [agents.aliases]
//! fast = "claude"
//!
//! [[workspace]]
//! name = "personal"
//! projects = [{ name = "tiflis", default_branch = "main" }]
//!
//! [logging]
//! level = "info"
//!
//! # Optional — omit entirely to run without a tunnel
//! [tunnel]
//! url = "wss://relay.example.com/tunnel"
//! tunnel_id = "t-0000"
//! tunnel_key = "shared-secret"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! keepalive_interval_secs = 30
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use tiflis_protocol::{ProjectInfo, WorkspaceInfo};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default, rename = "workspace")]
    pub workspaces: Vec<WorkspaceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional tunnel configuration; `None` disables the tunnel entirely.
    pub tunnel: Option<TunnelConfig>,
}

/// Server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the direct LAN WebSocket endpoint (default `0.0.0.0:7433`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Name reported to clients in `auth.success`.
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum concurrent non-supervisor sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Ring buffer entries kept per terminal session (default 1000).
    #[serde(default = "default_terminal_buffer_size")]
    pub terminal_buffer_size: usize,
    /// Per-device fan-out queue size; an overflowing device is dropped (default 256).
    #[serde(default = "default_fanout_queue_size")]
    pub fanout_queue_size: usize,
    /// Directory for the message database and audio blobs. Default `/var/lib/tiflisd`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Root of the workspace tree reported in `auth.success`.
    #[serde(default = "default_workspaces_root")]
    pub workspaces_root: String,
    /// Seconds without a heartbeat before an idle device is removed (default 120).
    #[serde(default = "default_device_idle_timeout_secs")]
    pub device_idle_timeout_secs: u64,
    /// Default terminal rows for new terminal sessions (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Default terminal columns for new terminal sessions (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
    /// Default history page size (default 20, capped at 50 per request).
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared key clients present in `auth`. Override with `TIFLISD_AUTH_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_auth_key")]
    pub auth_key: String,
}

/// Agent naming: aliases resolve to base CLI types, hidden base types are
/// omitted from sync state but still usable by name.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_agent")]
    pub default_agent: String,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub hidden_base_types: Vec<String>,
}

/// One workspace entry in the configured tree.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// One project inside a workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Tunnel client settings — the workstation's outbound relay connection.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Relay WebSocket URL (e.g. `wss://relay.example.com/tunnel`).
    pub url: String,
    /// Tunnel identity clients pair against.
    pub tunnel_id: String,
    /// Shared secret for workstation ↔ relay registration.
    pub tunnel_key: String,
    /// Seconds before the first reconnect attempt (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between WebSocket keepalive pings to the relay (default 30).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:7433".to_string()
}
fn default_name() -> String {
    "workstation".to_string()
}
fn default_max_sessions() -> usize {
    20
}
fn default_terminal_buffer_size() -> usize {
    1000
}
fn default_fanout_queue_size() -> usize {
    256
}
fn default_data_dir() -> String {
    "/var/lib/tiflisd".to_string()
}
fn default_workspaces_root() -> String {
    "~/workspaces".to_string()
}
fn default_device_idle_timeout_secs() -> u64 {
    120
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_history_page_size() -> u32 {
    20
}
fn default_auth_key() -> String {
    "change-me".to_string()
}
fn default_agent() -> String {
    "claude".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_keepalive_interval() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            name: default_name(),
            max_sessions: default_max_sessions(),
            terminal_buffer_size: default_terminal_buffer_size(),
            fanout_queue_size: default_fanout_queue_size(),
            data_dir: default_data_dir(),
            workspaces_root: default_workspaces_root(),
            device_idle_timeout_secs: default_device_idle_timeout_secs(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_key: default_auth_key(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent(),
            aliases: HashMap::new(),
            hidden_base_types: Vec::new(),
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

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| format!("Failed to read config file {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("Failed to parse config file {p}: {e}"))?
        } else if Path::new("tiflisd.toml").exists() {
            let content = std::fs::read_to_string("tiflisd.toml")
                .map_err(|e| format!("Failed to read tiflisd.toml: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("Failed to parse tiflisd.toml: {e}"))?
        } else {
            toml::from_str("").map_err(|e| format!("defaults: {e}"))?
        };

        if let Ok(key) = std::env::var("TIFLISD_AUTH_KEY") {
            config.auth.auth_key = key;
        }
        if let Ok(listen) = std::env::var("TIFLISD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("TIFLISD_DATA_DIR") {
            config.server.data_dir = dir;
        }

        Ok(config)
    }

    /// Validate cross-field constraints. Returns human-readable errors.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.auth.auth_key.is_empty() {
            errors.push("auth.auth_key must not be empty".to_string());
        }
        if self.server.max_sessions == 0 {
            errors.push("server.max_sessions must be at least 1".to_string());
        }
        if self.server.terminal_buffer_size == 0 {
            errors.push("server.terminal_buffer_size must be at least 1".to_string());
        }
        if let Some(tunnel) = &self.tunnel {
            if tunnel.url.is_empty() || tunnel.tunnel_id.is_empty() {
                errors.push("tunnel.url and tunnel.tunnel_id are required".to_string());
            }
        }
        errors
    }

    /// Workspace tree in wire form.
    pub fn workspace_tree(&self) -> Vec<WorkspaceInfo> {
        self.workspaces
            .iter()
            .map(|w| WorkspaceInfo {
                name: w.name.clone(),
                projects: w
                    .projects
                    .iter()
                    .map(|p| ProjectInfo {
                        name: p.name.clone(),
                        default_branch: p.default_branch.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}
