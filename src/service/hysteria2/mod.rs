//! Hysteria2 protocol backend.

pub mod port_hop;

use crate::api::{NodeInfo, NodeType};
use crate::error::{AgentError, Result};
use crate::service::{ProtocolBackend, ServiceConfig};

pub struct Hysteria2Backend;

impl ProtocolBackend for Hysteria2Backend {
    fn node_type(&self) -> NodeType {
        NodeType::Hysteria2
    }

    fn validate(&self, node: &NodeInfo, config: &ServiceConfig) -> Result<()> {
        let hy = node
            .hysteria2
            .as_ref()
            .ok_or_else(|| AgentError::Config("Hysteria2Config is nil in node info".to_string()))?;
        if config.cert.is_none() {
            return Err(AgentError::Config(
                "CertConfig is required for Hysteria2".to_string(),
            ));
        }

        let obfs = if hy.obfs.is_empty() {
            "salamander"
        } else {
            hy.obfs.as_str()
        };
        match obfs {
            "salamander" => {
                if hy.obfs_password.is_empty() {
                    return Err(AgentError::Config(
                        "obfs_password is required when obfs is salamander".to_string(),
                    ));
                }
            }
            "none" | "plain" => {}
            other => {
                return Err(AgentError::Config(format!(
                    "unsupported hysteria2 obfs: {other}"
                )));
            }
        }
        Ok(())
    }

    fn port_hop_rules(&self, node: &NodeInfo) -> Vec<port_hop::PortHopRule> {
        port_hop::rules_from_node(node)
    }
}
