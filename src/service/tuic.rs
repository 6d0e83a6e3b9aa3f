//! TUIC protocol backend.

use crate::api::{NodeInfo, NodeType};
use crate::error::{AgentError, Result};
use crate::service::{ProtocolBackend, ServiceConfig};

pub struct TuicBackend;

impl ProtocolBackend for TuicBackend {
    fn node_type(&self) -> NodeType {
        NodeType::Tuic
    }

    /// TUIC tolerates a missing sub-config (defaults apply), but always
    /// terminates TLS and therefore needs certificate configuration.
    fn validate(&self, _node: &NodeInfo, config: &ServiceConfig) -> Result<()> {
        if config.cert.is_none() {
            return Err(AgentError::Config(
                "CertConfig is required for TUIC".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::cert::CertConfig;

    #[test]
    fn test_validate_requires_cert_only() {
        let backend = TuicBackend;
        let node = NodeInfo {
            node_type: NodeType::Tuic,
            node_id: 1,
            port: 443,
            speed_limit: 0,
            host: String::new(),
            sni: String::new(),
            enable_tls: true,
            hysteria2: None,
            tuic: None,
            anytls: None,
        };

        assert!(backend.validate(&node, &ServiceConfig::default()).is_err());

        let config = ServiceConfig {
            cert: Some(CertConfig::default()),
            ..ServiceConfig::default()
        };
        // Missing TuicConfig is fine; defaults apply.
        assert!(backend.validate(&node, &config).is_ok());
    }
}
