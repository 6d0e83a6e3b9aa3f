//! AnyTLS protocol backend.

use crate::api::{NodeInfo, NodeType};
use crate::error::{AgentError, Result};
use crate::service::{ProtocolBackend, ServiceConfig};

pub struct AnyTlsBackend;

impl ProtocolBackend for AnyTlsBackend {
    fn node_type(&self) -> NodeType {
        NodeType::AnyTls
    }

    fn validate(&self, _node: &NodeInfo, config: &ServiceConfig) -> Result<()> {
        if config.cert.is_none() {
            return Err(AgentError::Config(
                "CertConfig is required for AnyTLS".to_string(),
            ));
        }
        Ok(())
    }
}
