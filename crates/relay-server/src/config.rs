//! Server configuration: TOML file + CLI overrides.

use relay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_message_bytes: default_max_message_bytes(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_drop_log_every")]
    pub drop_log_every: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            drop_log_every: default_drop_log_every(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_max_message_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_outbound_queue() -> usize {
    64
}
fn default_max_pending() -> usize {
    5
}
fn default_drop_log_every() -> u64 {
    10
}
fn default_stats_interval() -> u64 {
    60
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_message_bytes: usize,
    pub outbound_queue: usize,
    pub max_pending: usize,
    pub drop_log_every: u64,
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &CliOverrides::default())
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_pending: Option<usize>,
    pub stats_interval_secs: Option<u64>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::from_file(file_config, cli))
    }

    fn parse(content: &str) -> RelayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }

    fn from_file(file: ConfigFile, cli: &CliOverrides) -> Self {
        Self {
            host: cli.host.clone().unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            max_message_bytes: file.server.max_message_bytes,
            outbound_queue: file.server.outbound_queue.max(1),
            max_pending: cli.max_pending.unwrap_or(file.relay.max_pending),
            drop_log_every: file.relay.drop_log_every.max(1),
            stats_interval_secs: cli
                .stats_interval_secs
                .unwrap_or(file.relay.stats_interval_secs),
        }
    }

    /// `host:port` string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
    path.to_path_buf()
}
