//! Panel data model and client contract.
//!
//! The panel is the source of truth: the agent polls it for node and user
//! configuration and reports traffic, online devices and rule violations
//! back. Endpoints that support conditional requests answer with a
//! `NotModified` sentinel instead of a body.

mod client;

pub use client::{PanelConfig, WebPanelClient};

use std::fmt;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const USER_NOT_MODIFIED: &str = "users not modified";
pub const NODE_NOT_MODIFIED: &str = "node not modified";
pub const RULE_NOT_MODIFIED: &str = "rules not modified";

/// Error type for panel operations.
#[derive(Error, Debug)]
pub enum PanelError {
    /// The panel answered 304; the cached state is still current.
    #[error("{0}")]
    NotModified(&'static str),

    #[error("panel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("panel returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode panel response: {0}")]
    Decode(String),
}

impl PanelError {
    pub fn not_modified_users() -> Self {
        PanelError::NotModified(USER_NOT_MODIFIED)
    }

    pub fn not_modified_node() -> Self {
        PanelError::NotModified(NODE_NOT_MODIFIED)
    }

    pub fn not_modified_rules() -> Self {
        PanelError::NotModified(RULE_NOT_MODIFIED)
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self, PanelError::NotModified(_))
    }
}

/// Node protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeType {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
    AnyTls,
}

impl NodeType {
    /// Classic protocols ride the dispatch interception path; the QUIC-based
    /// ones own their embedded server callbacks directly.
    pub fn is_classic(&self) -> bool {
        matches!(
            self,
            NodeType::Vmess | NodeType::Vless | NodeType::Trojan | NodeType::Shadowsocks
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Vmess => "Vmess",
            NodeType::Vless => "VLESS",
            NodeType::Trojan => "Trojan",
            NodeType::Shadowsocks => "Shadowsocks",
            NodeType::Hysteria2 => "Hysteria2",
            NodeType::Tuic => "Tuic",
            NodeType::AnyTls => "AnyTLS",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vmess" | "v2ray" => Ok(NodeType::Vmess),
            "vless" => Ok(NodeType::Vless),
            "trojan" => Ok(NodeType::Trojan),
            "shadowsocks" => Ok(NodeType::Shadowsocks),
            "hysteria2" => Ok(NodeType::Hysteria2),
            "tuic" => Ok(NodeType::Tuic),
            "anytls" => Ok(NodeType::AnyTls),
            other => Err(format!("unknown node type: {other}")),
        }
    }
}

impl TryFrom<String> for NodeType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> String {
        t.as_str().to_string()
    }
}

/// Node configuration as served by the panel.
///
/// Compared with deep equality by the node monitor: panels bump ETags on
/// metadata churn, and only a real change may trigger a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub node_id: i64,
    pub port: u16,
    /// Per-node speed limit in bytes per second, 0 = unlimited.
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub hysteria2: Option<Hysteria2Config>,
    #[serde(default)]
    pub tuic: Option<TuicConfig>,
    #[serde(default)]
    pub anytls: Option<AnyTlsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hysteria2Config {
    #[serde(default)]
    pub obfs: String,
    #[serde(default)]
    pub obfs_password: String,
    #[serde(default)]
    pub up_mbps: u32,
    #[serde(default)]
    pub down_mbps: u32,
    #[serde(default)]
    pub ignore_client_bandwidth: bool,
    #[serde(default)]
    pub port_hop_enabled: bool,
    #[serde(default)]
    pub port_hop_ports: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuicConfig {
    #[serde(default)]
    pub congestion_control: String,
    #[serde(default)]
    pub udp_relay_mode: String,
    #[serde(default)]
    pub zero_rtt_handshake: bool,
    #[serde(default)]
    pub heartbeat: u32,
    #[serde(default)]
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnyTlsConfig {
    #[serde(default)]
    pub padding_scheme: Vec<String>,
}

/// A panel user as delivered by the user list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub passwd: String,
    /// Bytes per second, 0 = unlimited.
    #[serde(default)]
    pub speed_limit: u64,
    /// Concurrent distinct IPs, 0 = unlimited.
    #[serde(default)]
    pub device_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub uid: i64,
    pub email: String,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub uid: i64,
    pub ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub uptime: u64,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub api_host: String,
    pub node_id: i64,
    pub key: String,
    pub node_type: NodeType,
}

/// Compiled audit rule.
#[derive(Debug, Clone)]
pub struct DetectRule {
    pub id: i64,
    pub pattern: Regex,
}

impl PartialEq for DetectRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pattern.as_str() == other.pattern.as_str()
    }
}

impl<'de> Deserialize<'de> for DetectRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            id: i64,
            pattern: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        let pattern = Regex::new(&raw.pattern).map_err(serde::de::Error::custom)?;
        Ok(DetectRule {
            id: raw.id,
            pattern,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DetectResult {
    pub uid: i64,
    pub rule_id: i64,
    pub ip: String,
}

/// Contract the control loop consumes. One client per node.
#[async_trait]
pub trait PanelClient: Send + Sync {
    fn describe(&self) -> ClientInfo;

    async fn get_node_info(&self) -> Result<NodeInfo, PanelError>;

    async fn get_user_list(&self) -> Result<Vec<UserInfo>, PanelError>;

    async fn get_node_rules(&self) -> Result<Vec<DetectRule>, PanelError>;

    async fn report_node_status(&self, status: &NodeStatus) -> Result<(), PanelError>;

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<(), PanelError>;

    async fn report_online_users(&self, users: &[OnlineUser]) -> Result<(), PanelError>;

    async fn report_illegal(&self, results: &[DetectResult]) -> Result<(), PanelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_modified_sentinels() {
        assert_eq!(
            format!("{}", PanelError::not_modified_users()),
            "users not modified"
        );
        assert_eq!(
            format!("{}", PanelError::not_modified_node()),
            "node not modified"
        );
        assert_eq!(
            format!("{}", PanelError::not_modified_rules()),
            "rules not modified"
        );
        assert!(PanelError::not_modified_users().is_not_modified());
        assert!(!PanelError::Decode("bad json".into()).is_not_modified());
    }

    #[test]
    fn test_node_type_display_matches_tag_prefixes() {
        assert_eq!(NodeType::Vmess.to_string(), "Vmess");
        assert_eq!(NodeType::Vless.to_string(), "VLESS");
        assert_eq!(NodeType::Trojan.to_string(), "Trojan");
        assert_eq!(NodeType::Shadowsocks.to_string(), "Shadowsocks");
        assert_eq!(NodeType::Hysteria2.to_string(), "Hysteria2");
        assert_eq!(NodeType::Tuic.to_string(), "Tuic");
        assert_eq!(NodeType::AnyTls.to_string(), "AnyTLS");
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!("hysteria2".parse::<NodeType>().unwrap(), NodeType::Hysteria2);
        assert_eq!("V2ray".parse::<NodeType>().unwrap(), NodeType::Vmess);
        assert_eq!("AnyTLS".parse::<NodeType>().unwrap(), NodeType::AnyTls);
        assert!("wireguard".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_node_type_classic() {
        assert!(NodeType::Vmess.is_classic());
        assert!(NodeType::Shadowsocks.is_classic());
        assert!(!NodeType::Hysteria2.is_classic());
        assert!(!NodeType::Tuic.is_classic());
    }

    #[test]
    fn test_node_info_deep_equality() {
        let json = r#"{
            "node_type": "Hysteria2",
            "node_id": 7,
            "port": 30000,
            "speed_limit": 0,
            "sni": "example.com",
            "enable_tls": true,
            "hysteria2": {"obfs": "salamander", "obfs_password": "pw"}
        }"#;
        let a: NodeInfo = serde_json::from_str(json).unwrap();
        let b: NodeInfo = serde_json::from_str(json).unwrap();
        assert_eq!(a, b);

        let mut c = b.clone();
        c.port = 30001;
        assert_ne!(a, c);
    }

    #[test]
    fn test_detect_rule_deserialize() {
        let rule: DetectRule =
            serde_json::from_str(r#"{"id": 3, "pattern": "^ads\\.example\\.com$"}"#).unwrap();
        assert_eq!(rule.id, 3);
        assert!(rule.pattern.is_match("ads.example.com"));
        assert!(!rule.pattern.is_match("ads.example.com.cn"));
    }

    #[test]
    fn test_detect_rule_deserialize_invalid_pattern() {
        let res: Result<DetectRule, _> = serde_json::from_str(r#"{"id": 1, "pattern": "("}"#);
        assert!(res.is_err());
    }
}
