//! Per-node services.
//!
//! [`node::NodeService`] is the engine shared by every protocol: it owns the
//! embedded server, the in-memory user/traffic/online model and the control
//! loop. Protocol specifics live in small [`ProtocolBackend`] implementations.

pub mod anytls;
pub mod classic;
pub mod hooks;
pub mod hysteria2;
pub mod monitor;
pub mod node;
pub mod tuic;

pub use node::NodeService;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::api::{NodeInfo, NodeType, OnlineUser, UserInfo};
use crate::common::cert::CertConfig;
use crate::common::limiter::GlobalDeviceLimitConfig;
use crate::error::{AgentError, Result};
use crate::service::hysteria2::port_hop::PortHopRule;

/// Unique per-node identity: `{NodeType}_{ListenIP}_{Port}_{NodeID}`.
pub fn build_tag(node_type: NodeType, listen_ip: IpAddr, port: u16, node_id: i64) -> String {
    format!("{node_type}_{listen_ip}_{port}_{node_id}")
}

/// Local settings for one node service.
#[derive(Clone)]
pub struct ServiceConfig {
    pub listen_ip: IpAddr,
    pub update_interval: Duration,
    pub cert: Option<CertConfig>,
    pub disable_get_rules: bool,
    pub disable_upload_traffic: bool,
    pub global_device_limit: Option<GlobalDeviceLimitConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            update_interval: Duration::from_secs(60),
            cert: None,
            disable_get_rules: false,
            disable_upload_traffic: false,
            global_device_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    New,
    Running,
    Reloading,
    Closed,
}

/// A running node service.
#[async_trait]
pub trait Service: Send + Sync {
    fn tag(&self) -> String;

    async fn start(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Process-wide tag ownership. Two services may never share a tag.
pub struct TagRegistry {
    tags: DashMap<String, ()>,
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TagRegistry {
    pub fn new() -> Self {
        Self {
            tags: DashMap::new(),
        }
    }

    pub fn claim(&self, tag: &str) -> Result<()> {
        if self.tags.insert(tag.to_string(), ()).is_some() {
            return Err(AgentError::Config(format!(
                "duplicate node tag: {tag}"
            )));
        }
        Ok(())
    }

    pub fn release(&self, tag: &str) {
        self.tags.remove(tag);
    }
}

/// Protocol-specific contributions to the shared engine.
pub trait ProtocolBackend: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Protocol-specific node validation, run before (re)building the server.
    fn validate(&self, node: &NodeInfo, config: &ServiceConfig) -> Result<()>;

    /// Firewall port-hop rules for this node, if any.
    fn port_hop_rules(&self, _node: &NodeInfo) -> Vec<PortHopRule> {
        Vec::new()
    }

    /// Invoked once the tag is composed and the initial user list is synced.
    fn on_started(
        &self,
        _tag: &str,
        _node: &NodeInfo,
        _users: &[UserInfo],
        _config: &ServiceConfig,
    ) -> Result<()> {
        Ok(())
    }

    fn on_users_synced(&self, _tag: &str, _users: &[UserInfo]) {}

    fn on_reloaded(
        &self,
        _tag: &str,
        _node: &NodeInfo,
        _users: &[UserInfo],
        _config: &ServiceConfig,
    ) {
    }

    /// Drain protocol-side online devices for the report cycle.
    fn drain_online(&self, _tag: &str) -> Vec<OnlineUser> {
        Vec::new()
    }

    fn on_closed(&self, _tag: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tag_format() {
        let tag = build_tag(NodeType::Hysteria2, IpAddr::from([0, 0, 0, 0]), 30000, 7);
        assert_eq!(tag, "Hysteria2_0.0.0.0_30000_7");

        let tag = build_tag(NodeType::Vless, IpAddr::from([10, 0, 0, 1]), 443, 2);
        assert_eq!(tag, "VLESS_10.0.0.1_443_2");
    }

    #[test]
    fn test_tag_registry_refuses_duplicates() {
        let registry = TagRegistry::new();
        registry.claim("Hysteria2_0.0.0.0_443_1").unwrap();
        assert!(registry.claim("Hysteria2_0.0.0.0_443_1").is_err());

        registry.release("Hysteria2_0.0.0.0_443_1");
        assert!(registry.claim("Hysteria2_0.0.0.0_443_1").is_ok());
    }
}
