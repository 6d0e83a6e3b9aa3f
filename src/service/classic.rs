//! Backend for the classic protocols (VMess, VLESS, Trojan, Shadowsocks).
//!
//! Classic inbound cores do not count devices themselves; admission and
//! speed limiting happen on the dispatch path through the shared
//! [`Limiter`] and a [`DataPathWrapper`] registered under the node tag.

use std::sync::Arc;
use std::time::Duration;

use crate::api::{NodeInfo, NodeType, OnlineUser, UserInfo};
use crate::common::limiter::Limiter;
use crate::common::rule::RuleManager;
use crate::dispatch::{DataPathWrapper, DirectOutbound, OutboundHandler, OutboundManager};
use crate::error::{AgentError, Result};
use crate::logger::log;
use crate::service::{ProtocolBackend, ServiceConfig};

pub struct ClassicBackend {
    node_type: NodeType,
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
    outbounds: Arc<OutboundManager>,
    connect_timeout: Duration,
}

impl ClassicBackend {
    pub fn new(
        node_type: NodeType,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
        outbounds: Arc<OutboundManager>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        if !node_type.is_classic() {
            return Err(AgentError::Config(format!(
                "{node_type} is not a classic protocol"
            )));
        }
        Ok(Self {
            node_type,
            limiter,
            rules,
            outbounds,
            connect_timeout,
        })
    }

    fn register(&self, tag: &str, node: &NodeInfo, users: &[UserInfo], config: &ServiceConfig) -> Result<()> {
        self.limiter.add_inbound(
            tag,
            node.speed_limit,
            users,
            config.global_device_limit.as_ref(),
        )?;

        let direct: Arc<dyn OutboundHandler> = Arc::new(DirectOutbound::new(
            "direct".to_string(),
            self.connect_timeout,
        ));
        let wrapper = DataPathWrapper::new(
            direct,
            tag.to_string(),
            Arc::clone(&self.limiter),
            Arc::clone(&self.rules),
            &self.outbounds,
        );
        self.outbounds.add_handler(Arc::new(wrapper));
        Ok(())
    }
}

impl ProtocolBackend for ClassicBackend {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn validate(&self, node: &NodeInfo, config: &ServiceConfig) -> Result<()> {
        if node.enable_tls && config.cert.is_none() {
            return Err(AgentError::Config(
                "CertConfig is required when TLS is enabled".to_string(),
            ));
        }
        Ok(())
    }

    fn on_started(
        &self,
        tag: &str,
        node: &NodeInfo,
        users: &[UserInfo],
        config: &ServiceConfig,
    ) -> Result<()> {
        self.register(tag, node, users, config)
    }

    fn on_users_synced(&self, tag: &str, users: &[UserInfo]) {
        if let Err(e) = self.limiter.update_inbound(tag, users) {
            log::warn!(tag = %tag, error = %e, "Update inbound limiter failed");
        }
    }

    /// The node speed limit may have changed; rebuild the tag's limiter
    /// entry from scratch.
    fn on_reloaded(
        &self,
        tag: &str,
        node: &NodeInfo,
        users: &[UserInfo],
        config: &ServiceConfig,
    ) {
        self.limiter.delete_inbound(tag);
        if let Err(e) = self.register(tag, node, users, config) {
            log::warn!(tag = %tag, error = %e, "Re-register inbound limiter failed");
        }
    }

    fn drain_online(&self, tag: &str) -> Vec<OnlineUser> {
        match self.limiter.get_online_device(tag) {
            Ok(online) => online,
            Err(e) => {
                log::debug!(tag = %tag, error = %e, "Get online device failed");
                Vec::new()
            }
        }
    }

    fn on_closed(&self, tag: &str) {
        self.limiter.delete_inbound(tag);
        self.outbounds.remove_handler(tag);
    }
}
