use thiserror::Error;

use crate::api::PanelError;

/// Unified error type for the agent service layer.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Invalid node info or local configuration. Fatal to start/reload.
    #[error("configuration error: {0}")]
    Config(String),

    /// Panel communication failure. Logged and retried next cycle.
    #[error(transparent)]
    Panel(#[from] PanelError),

    /// Embedded protocol server failure.
    #[error("embedded server error: {0}")]
    Server(String),

    /// Limiter lookup against a tag that was never registered.
    #[error("no such inbound in limiter: {0}")]
    UnknownTag(String),

    /// Firewall rule installation failure.
    #[error("firewall error: {0}")]
    Firewall(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
