use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

pub const DEFAULT_LISTEN_ADDRESS: &str = ":9455";
pub const DEFAULT_TELEMETRY_PATH: &str = "/metrics";
pub const DEFAULT_SAVE_COMMAND: &str = "iptables-save";

/// Exporter configuration, loadable from YAML.
///
/// Every field has a default so an empty file (or no file) is valid:
///
/// ```yaml
/// web:
///   listen_address: "127.0.0.1:9455"
///   telemetry_path: /metrics
/// collector:
///   command: ip6tables-save
///   args: ["-c"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_save_command")]
    pub command: String,
    /// Must keep `-c`, the dump is useless without counters.
    #[serde(default = "default_save_args")]
    pub args: Vec<String>,
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_telemetry_path() -> String {
    DEFAULT_TELEMETRY_PATH.to_string()
}

fn default_save_command() -> String {
    DEFAULT_SAVE_COMMAND.to_string()
}

fn default_save_args() -> Vec<String> {
    vec!["-c".to_string()]
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            telemetry_path: default_telemetry_path(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            command: default_save_command(),
            args: default_save_args(),
        }
    }
}

impl ExporterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // serde_yaml rejects an empty document, treat it as all defaults
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let path = &self.web.telemetry_path;
        if !path.starts_with('/') {
            bail!("Telemetry path '{}' must start with '/'", path);
        }
        if path == "/" {
            bail!("Telemetry path must not be '/', it serves the landing page");
        }
        if self.collector.command.trim().is_empty() {
            bail!("Collector command must not be empty");
        }
        parse_listen_address(&self.web.listen_address)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen_address(&self.web.listen_address)
    }
}

/// Parse a listen address.
///
/// Accepts `host:port`, `[v6]:port` and `:port`, the latter binding all
/// IPv4 interfaces.
pub fn parse_listen_address(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("Invalid port in listen address '{}'", addr))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }

    addr.to_socket_addrs()
        .with_context(|| format!("Invalid listen address '{}'", addr))?
        .next()
        .with_context(|| format!("Listen address '{}' did not resolve", addr))
}
