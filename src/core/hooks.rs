//! Hook traits injected into embedded protocol servers.
//!
//! The core invokes these for every session: the authenticator on admission,
//! the event logger on requests and disconnects, and the traffic logger on
//! every accounting callback. The stable id returned by the authenticator is
//! the connection identity in all subsequent callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

/// Stable connection identity handed out by the authenticator.
pub type ConnectionId = String;

pub trait Authenticator: Send + Sync {
    /// Authenticate a new session. Returns the connection id on success.
    fn authenticate(&self, addr: SocketAddr, auth: &str, tx: u64) -> Option<ConnectionId>;
}

pub trait EventLogger: Send + Sync {
    fn connect(&self, addr: SocketAddr, id: &str, tx: u64);

    fn disconnect(&self, addr: SocketAddr, id: &str, err: Option<&str>);

    fn tcp_request(&self, addr: SocketAddr, id: &str, req_addr: &str);

    fn tcp_error(&self, addr: SocketAddr, id: &str, req_addr: &str, err: &str);

    fn udp_request(&self, addr: SocketAddr, id: &str, session_id: u32, req_addr: &str);

    fn udp_error(&self, addr: SocketAddr, id: &str, session_id: u32, err: &str);
}

#[async_trait]
pub trait TrafficLogger: Send + Sync {
    /// Account `tx`/`rx` bytes for a connection. Returning false instructs
    /// the embedded server to terminate the connection.
    async fn log_traffic(&self, id: &str, tx: u64, rx: u64) -> bool;

    fn log_online_state(&self, id: &str, online: bool);
}

/// The callback bundle an embedded server is built with.
#[derive(Clone)]
pub struct ServerHooks {
    pub authenticator: Arc<dyn Authenticator>,
    pub events: Arc<dyn EventLogger>,
    pub traffic: Arc<dyn TrafficLogger>,
}
