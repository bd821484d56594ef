//! Daemon Configuration
//!
//! Loaded from `$XDG_CONFIG_HOME/peerdrop/daemon.toml` unless `--config`
//! points elsewhere. A default file is written on first start so the
//! generated username stays stable across runs.

use anyhow::{bail, Context, Result};
use peerdrop_protocol::{generate_username, LivenessConfig, NodeConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub liveness: LivenessSection,

    #[serde(default)]
    pub transfer: TransferSection,

    /// Address book: alias → `host:port`
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    /// Display name announced to peers
    #[serde(default = "generate_username")]
    pub username: String,

    /// Identifier peers know this node by
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Address the TCP listener binds to in `serve` mode
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Dial timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessSection {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_ping_attempts")]
    pub ping_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSection {
    /// Where received files are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Save every received file as soon as it arrives
    #[serde(default = "default_true")]
    pub auto_save: bool,
}

fn default_peer_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("peerdrop-{}", host)
}

fn default_listen_addr() -> String {
    "0.0.0.0:4717".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_ping_attempts() -> u32 {
    3
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
        .join("peerdrop")
}

fn default_true() -> bool {
    true
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            username: generate_username(),
            peer_id: default_peer_id(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_attempts: default_ping_attempts(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            auto_save: true,
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/peerdrop/daemon.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("peerdrop")
            .join("daemon.toml")
    }

    /// Load configuration, writing a default file if none exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            let config = Config::default();
            config.save(&path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, self.to_toml()?).context("Failed to write config file")?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.username.trim().is_empty() {
            bail!("node.username must not be empty");
        }
        self.node_config()
            .validate()
            .context("Invalid [node] or [liveness] settings")?;
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid network.listen_addr '{}'", self.network.listen_addr))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            probe_interval: Duration::from_millis(self.liveness.probe_interval_ms),
            ping_timeout: Duration::from_millis(self.liveness.ping_timeout_ms),
            ping_attempts: self.liveness.ping_attempts,
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig::new(self.node.peer_id.clone())
            .with_username(self.node.username.clone())
            .with_liveness(self.liveness_config())
    }

    /// Address book in the form the TCP transport expects
    pub fn address_book(&self) -> std::collections::HashMap<String, String> {
        self.peers
            .iter()
            .map(|(alias, addr)| (alias.clone(), addr.clone()))
            .collect()
    }
}
