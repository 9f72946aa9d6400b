//! Server configuration: TOML file + CLI/env overrides.

use crate::proxy::ProxyPolicy;
use crate::session::{default_shell, RegistrySettings};
use crate::transport::GatewaySettings;
use ptyhub_core::{HubError, HubResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub input: InputSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shell command line; unset means the platform default.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            shell: None,
            max_sessions: default_max_sessions(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// `[history]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

/// `[input]` section: per-connection token bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct InputSection {
    #[serde(default = "default_input_burst")]
    pub burst: u32,
    #[serde(default = "default_input_rate")]
    pub refill_per_sec: u32,
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            burst: default_input_burst(),
            refill_per_sec: default_input_rate(),
        }
    }
}

/// `[proxy]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_proxy_max_connections")]
    pub max_connections: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxy_timeout(),
            max_connections: default_proxy_max_connections(),
        }
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
        }
    }
}

fn default_port() -> u16 {
    4000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_history_capacity() -> usize {
    512 * 1024
}
fn default_input_burst() -> u32 {
    32 * 1024
}
fn default_input_rate() -> u32 {
    16 * 1024
}
fn default_proxy_timeout() -> u64 {
    12
}
fn default_proxy_max_connections() -> usize {
    256
}
fn default_outbound_queue() -> usize {
    1024
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub shell: Option<String>,
    pub max_sessions: Option<usize>,
    pub history_bytes: Option<usize>,
    pub input_burst: Option<u32>,
    pub input_rate: Option<u32>,
    pub proxy_timeout_secs: Option<u64>,
}

/// Resolved server configuration (file merged with overrides, validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: IpAddr,
    pub shell: String,
    pub max_sessions: usize,
    pub cols: u16,
    pub rows: u16,
    pub history_capacity: usize,
    pub input_burst: u32,
    pub input_rate: u32,
    pub proxy_timeout: Duration,
    pub proxy_max_connections: usize,
    pub outbound_queue: usize,
}

impl ServerConfig {
    /// Load config from a TOML file (missing file = defaults), then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> HubResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> HubResult<Self> {
        let bind_str = overrides.bind.unwrap_or(file.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| HubError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;
        let shell = overrides
            .shell
            .or(file.server.shell)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_shell);

        let config = Self {
            port: overrides.port.unwrap_or(file.server.port),
            bind,
            shell,
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            cols: file.server.cols,
            rows: file.server.rows,
            history_capacity: overrides.history_bytes.unwrap_or(file.history.capacity),
            input_burst: overrides.input_burst.unwrap_or(file.input.burst),
            input_rate: overrides.input_rate.unwrap_or(file.input.refill_per_sec),
            proxy_timeout: Duration::from_secs(
                overrides
                    .proxy_timeout_secs
                    .unwrap_or(file.proxy.timeout_secs),
            ),
            proxy_max_connections: file.proxy.max_connections,
            outbound_queue: file.gateway.outbound_queue,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> HubResult<()> {
        let checks = [
            ("server.max_sessions", self.max_sessions as u64),
            ("server.cols", u64::from(self.cols)),
            ("server.rows", u64::from(self.rows)),
            ("history.capacity", self.history_capacity as u64),
            ("input.burst", u64::from(self.input_burst)),
            ("input.refill_per_sec", u64::from(self.input_rate)),
            ("proxy.timeout_secs", self.proxy_timeout.as_secs()),
            ("proxy.max_connections", self.proxy_max_connections as u64),
            ("gateway.outbound_queue", self.outbound_queue as u64),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(HubError::Config(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_sessions: self.max_sessions,
            history_capacity: self.history_capacity,
            cols: self.cols,
            rows: self.rows,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            input_burst: self.input_burst,
            input_rate: self.input_rate,
            outbound_queue: self.outbound_queue,
        }
    }

    /// Proxy rules for a server actually listening on `own_port`.
    pub fn proxy_policy(&self, own_port: u16) -> ProxyPolicy {
        ProxyPolicy {
            own_port,
            max_connections: self.proxy_max_connections,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let file = ConfigFile::default();
        Self {
            port: file.server.port,
            bind: IpAddr::from([0, 0, 0, 0]),
            shell: default_shell(),
            max_sessions: file.server.max_sessions,
            cols: file.server.cols,
            rows: file.server.rows,
            history_capacity: file.history.capacity,
            input_burst: file.input.burst,
            input_rate: file.input.refill_per_sec,
            proxy_timeout: Duration::from_secs(file.proxy.timeout_secs),
            proxy_max_connections: file.proxy.max_connections,
            outbound_queue: file.gateway.outbound_queue,
        }
    }
}

fn parse_config(content: &str) -> HubResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HubError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
