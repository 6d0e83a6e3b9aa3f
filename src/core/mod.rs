//! Embedded protocol server contract.
//!
//! Protocol cores (QUIC-based and classic alike) are opaque to the agent:
//! they are built by a [`server::ServerFactory`] from a [`server::ServerSpec`]
//! plus the hook bundle, and controlled only through
//! [`server::EmbeddedServer`].

pub mod hooks;
pub mod server;

pub use hooks::{Authenticator, ConnectionId, EventLogger, ServerHooks, TrafficLogger};
pub use server::{EmbeddedServer, PortReserveFactory, ServerFactory, ServerSpec};
