//! Embedded server lifecycle seam.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::hooks::ServerHooks;
use crate::api::NodeInfo;
use crate::error::{AgentError, Result};
use crate::logger::log;

/// Everything a factory needs to bring up a protocol core for one node.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub tag: String,
    pub listen: SocketAddr,
    pub node: NodeInfo,
    /// Certificate and key paths when the node terminates TLS.
    pub cert: Option<(std::path::PathBuf, std::path::PathBuf)>,
}

/// An opaque, running protocol core. `serve` runs until `close`.
#[async_trait]
pub trait EmbeddedServer: Send + Sync {
    async fn serve(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds embedded servers. One factory instance serves all nodes.
#[async_trait]
pub trait ServerFactory: Send + Sync {
    async fn build(&self, spec: ServerSpec, hooks: ServerHooks) -> Result<Arc<dyn EmbeddedServer>>;
}

enum BoundSocket {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

/// Default factory: reserves the node's listen socket so port conflicts and
/// firewall interactions surface, and holds it until close. Real protocol
/// cores plug in by registering another [`ServerFactory`].
pub struct PortReserveFactory;

#[async_trait]
impl ServerFactory for PortReserveFactory {
    async fn build(&self, spec: ServerSpec, _hooks: ServerHooks) -> Result<Arc<dyn EmbeddedServer>> {
        let socket = match spec.node.node_type {
            t if !t.is_classic() => BoundSocket::Udp(
                UdpSocket::bind(spec.listen)
                    .await
                    .map_err(|e| AgentError::Server(format!("listen udp {}: {e}", spec.listen)))?,
            ),
            _ => BoundSocket::Tcp(
                TcpListener::bind(spec.listen)
                    .await
                    .map_err(|e| AgentError::Server(format!("listen tcp {}: {e}", spec.listen)))?,
            ),
        };
        log::info!(tag = %spec.tag, listen = %spec.listen, "Listen socket reserved");
        Ok(Arc::new(PortReserveServer {
            socket: Mutex::new(Some(socket)),
            cancel: CancellationToken::new(),
        }))
    }
}

pub struct PortReserveServer {
    socket: Mutex<Option<BoundSocket>>,
    cancel: CancellationToken,
}

#[async_trait]
impl EmbeddedServer for PortReserveServer {
    async fn serve(&self) -> Result<()> {
        self.cancel.cancelled().await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.socket.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::NodeType;
    use crate::core::hooks::{Authenticator, ConnectionId, EventLogger, TrafficLogger};

    struct NoAuth;
    impl Authenticator for NoAuth {
        fn authenticate(&self, _addr: SocketAddr, _auth: &str, _tx: u64) -> Option<ConnectionId> {
            None
        }
    }

    struct NoEvents;
    impl EventLogger for NoEvents {
        fn connect(&self, _addr: SocketAddr, _id: &str, _tx: u64) {}
        fn disconnect(&self, _addr: SocketAddr, _id: &str, _err: Option<&str>) {}
        fn tcp_request(&self, _addr: SocketAddr, _id: &str, _req_addr: &str) {}
        fn tcp_error(&self, _addr: SocketAddr, _id: &str, _req_addr: &str, _err: &str) {}
        fn udp_request(&self, _addr: SocketAddr, _id: &str, _session_id: u32, _req_addr: &str) {}
        fn udp_error(&self, _addr: SocketAddr, _id: &str, _session_id: u32, _err: &str) {}
    }

    struct NoTraffic;
    #[async_trait]
    impl TrafficLogger for NoTraffic {
        async fn log_traffic(&self, _id: &str, _tx: u64, _rx: u64) -> bool {
            true
        }
        fn log_online_state(&self, _id: &str, _online: bool) {}
    }

    fn hooks() -> ServerHooks {
        ServerHooks {
            authenticator: Arc::new(NoAuth),
            events: Arc::new(NoEvents),
            traffic: Arc::new(NoTraffic),
        }
    }

    fn spec(node_type: NodeType, port: u16) -> ServerSpec {
        ServerSpec {
            tag: format!("{node_type}_127.0.0.1_{port}_1"),
            listen: SocketAddr::from(([127, 0, 0, 1], port)),
            node: NodeInfo {
                node_type,
                node_id: 1,
                port,
                speed_limit: 0,
                host: String::new(),
                sni: String::new(),
                enable_tls: false,
                hysteria2: None,
                tuic: None,
                anytls: None,
            },
            cert: None,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_udp_port() {
        let factory = PortReserveFactory;
        let server = factory
            .build(spec(NodeType::Hysteria2, 0), hooks())
            .await
            .unwrap();

        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve().await });
        server.close().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_classic_node_reserves_tcp() {
        let factory = PortReserveFactory;
        let server = factory
            .build(spec(NodeType::Trojan, 0), hooks())
            .await
            .unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_conflict_surfaces() {
        let keep = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = keep.local_addr().unwrap().port();

        let factory = PortReserveFactory;
        let err = factory.build(spec(NodeType::Vmess, port), hooks()).await;
        assert!(err.is_err());
    }
}
