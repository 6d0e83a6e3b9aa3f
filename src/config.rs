//! CLI arguments and the TOML node file.
//!
//! The agent takes a config file describing the panel endpoint and one entry
//! per node; everything else (ports, TLS, users, rules) comes from the panel
//! at runtime.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;

use crate::api::{NodeType, PanelConfig};
use crate::common::cert::CertConfig;
use crate::common::limiter::GlobalDeviceLimitConfig;
use crate::service::ServiceConfig;

/// Parse a duration string (e.g. "60s", "2m", "1h") or plain seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!("Invalid duration '{s}'. Use formats like '60s', '2m', '1h' or plain seconds")
    })
}

/// CLI arguments. Environment variables use the NODE_AGENT_ prefix.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-protocol proxy node agent")]
pub struct CliArgs {
    /// Path to the TOML config file
    #[arg(short, long, env = "NODE_AGENT_CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    /// Log level override: trace, debug, info, warn, error
    #[arg(long, env = "NODE_AGENT_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> String {
    "15s".to_string()
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_interval() -> String {
    "60s".to_string()
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelSettings {
    pub api_host: String,
    /// Panel API request timeout (e.g. "15s").
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub node_id: i64,
    pub node_type: NodeType,
    pub api_key: String,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    /// Control-loop interval (e.g. "60s").
    #[serde(default = "default_interval")]
    pub update_interval: String,
    /// Outbound TCP connect timeout for classic nodes.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    #[serde(default)]
    pub disable_get_rules: bool,
    #[serde(default)]
    pub disable_upload_traffic: bool,
    #[serde(default)]
    pub cert: Option<CertConfig>,
    #[serde(default)]
    pub global_device_limit: Option<GlobalDeviceLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub log: LogSettings,
    pub panel: PanelSettings,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl AgentConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("read config file {}: {e}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("parse config file {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.panel.api_host.is_empty() {
            return Err(anyhow!("panel.api_host is required"));
        }
        parse_duration(&self.panel.timeout).map_err(|e| anyhow!(e))?;
        if self.nodes.is_empty() {
            return Err(anyhow!("at least one [[nodes]] entry is required"));
        }
        for node in &self.nodes {
            if node.node_id <= 0 {
                return Err(anyhow!("node_id must be a positive integer"));
            }
            if node.api_key.is_empty() {
                return Err(anyhow!("api_key is required for node {}", node.node_id));
            }
            node.listen_ip
                .parse::<IpAddr>()
                .map_err(|_| anyhow!("invalid listen_ip for node {}: {}", node.node_id, node.listen_ip))?;
            let interval = parse_duration(&node.update_interval).map_err(|e| anyhow!(e))?;
            if interval.is_zero() {
                return Err(anyhow!("update_interval must be greater than 0"));
            }
            parse_duration(&node.connect_timeout).map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    pub fn panel_config(&self, node: &NodeEntry) -> PanelConfig {
        PanelConfig {
            api_host: self.panel.api_host.clone(),
            key: node.api_key.clone(),
            node_id: node.node_id,
            node_type: node.node_type,
            timeout: parse_duration(&self.panel.timeout).unwrap_or(Duration::from_secs(15)),
        }
    }
}

impl NodeEntry {
    pub fn service_config(&self) -> Result<ServiceConfig> {
        Ok(ServiceConfig {
            listen_ip: self.listen_ip.parse()?,
            update_interval: parse_duration(&self.update_interval).map_err(|e| anyhow!(e))?,
            cert: self.cert.clone(),
            disable_get_rules: self.disable_get_rules,
            disable_upload_traffic: self.disable_upload_traffic,
            global_device_limit: self.global_device_limit.clone(),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [log]
        level = "debug"

        [panel]
        api_host = "https://panel.example.com"
        timeout = "10s"

        [[nodes]]
        node_id = 7
        node_type = "Hysteria2"
        api_key = "secret"
        update_interval = "30s"
        cert = { cert_mode = "file", cert_file = "/etc/ssl/a.cert", key_file = "/etc/ssl/a.key" }

        [[nodes]]
        node_id = 8
        node_type = "Vmess"
        api_key = "secret2"
        listen_ip = "127.0.0.1"
        global_device_limit = { enable = true, redis_addr = "10.0.0.1:6379" }
    "#;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_sample_config() {
        let config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].node_type, NodeType::Hysteria2);
        assert_eq!(config.nodes[1].node_type, NodeType::Vmess);
        assert_eq!(config.nodes[1].listen_ip, "127.0.0.1");
        assert!(config.nodes[1].global_device_limit.as_ref().unwrap().enable);

        let service = config.nodes[0].service_config().unwrap();
        assert_eq!(service.update_interval, Duration::from_secs(30));
        assert!(service.cert.is_some());

        let panel = config.panel_config(&config.nodes[0]);
        assert_eq!(panel.node_id, 7);
        assert_eq!(panel.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_entries() {
        let mut config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        config.nodes[0].node_id = 0;
        assert!(config.validate().is_err());

        let mut config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        config.nodes[0].api_key = String::new();
        assert!(config.validate().is_err());

        let mut config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        config.nodes[0].listen_ip = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        config.nodes[0].update_interval = "0s".to_string();
        assert!(config.validate().is_err());

        let mut config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        config.nodes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AgentConfig::load(std::path::Path::new("/nonexistent/config.toml")).is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.nodes.len(), 2);
    }
}
