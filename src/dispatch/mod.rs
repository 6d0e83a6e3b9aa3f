//! Data-path interception for the classic protocols.
//!
//! Inbound cores hand every session to the outbound side through a
//! dispatch call. [`DataPathWrapper`] sits in front of the real outbound
//! handler to force the userland copy path, enforce same-node routing,
//! apply audit rules, and attach rate-limiting wrappers.

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::limiter::rate::{LinkReader, LinkWriter, RateReader, RateWriter};
use crate::common::limiter::Limiter;
use crate::common::rule::RuleManager;
use crate::logger::log;

const CHUNK_SIZE: usize = 32 * 1024;

/// Tag prefixes of inbounds managed by this agent. Managed tags have the
/// format `{Protocol}_{IP}_{Port}_{NodeID}`.
pub const MANAGED_PREFIXES: [&str; 4] = ["VLESS_", "Trojan_", "Vmess_", "Shadowsocks_"];

pub fn is_managed_tag(tag: &str) -> bool {
    MANAGED_PREFIXES.iter().any(|p| tag.starts_with(p))
}

/// How session bytes are moved between the two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Kernel-assisted splice; byte counts are invisible to the agent.
    Kernel,
    /// Userland copy; stats and rate limits are observed.
    Userland,
}

/// Per-connection metadata carried from the inbound core.
#[derive(Debug, Clone)]
pub struct Session {
    pub inbound_tag: String,
    /// Composite limiter key (`{tag}|{email}|{uid}`); empty when the inbound
    /// did not authenticate a user.
    pub user_key: String,
    pub source: IpAddr,
    /// Requested destination as `host:port`.
    pub destination: String,
    pub copy_mode: CopyMode,
}

/// The two directed halves of a proxied connection. Dropping a link closes
/// both sides.
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    async fn dispatch(&self, session: &mut Session, link: Link);
}

/// Registry of outbound handlers keyed by tag.
pub struct OutboundManager {
    handlers: DashMap<String, Arc<dyn OutboundHandler>>,
}

impl Default for OutboundManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundManager {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn OutboundHandler>) {
        self.handlers.insert(handler.tag().to_string(), handler);
    }

    pub fn get_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.get(tag).map(|e| Arc::clone(&e))
    }

    pub fn remove_handler(&self, tag: &str) {
        self.handlers.remove(tag);
    }
}

/// Outbound wrapper enforcing device limit, speed limit, audit rules and
/// same-node routing on every dispatched session.
pub struct DataPathWrapper {
    inner: Arc<dyn OutboundHandler>,
    tag: String,
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
    outbounds: Weak<OutboundManager>,
}

impl DataPathWrapper {
    pub fn new(
        inner: Arc<dyn OutboundHandler>,
        tag: String,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
        outbounds: &Arc<OutboundManager>,
    ) -> Self {
        Self {
            inner,
            tag,
            limiter,
            rules,
            outbounds: Arc::downgrade(outbounds),
        }
    }
}

#[async_trait]
impl OutboundHandler for DataPathWrapper {
    /// Tag must match the inbound tag so routing picks this wrapper for its
    /// own node's traffic.
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, session: &mut Session, link: Link) {
        // Stats and limits are only observed on the userland path.
        session.copy_mode = CopyMode::Userland;

        // Ingress on node N must egress from node N.
        let in_tag = session.inbound_tag.clone();
        if is_managed_tag(&in_tag) && !in_tag.is_empty() && in_tag != self.tag {
            let Some(manager) = self.outbounds.upgrade() else {
                log::error!(
                    inbound_tag = %in_tag,
                    outbound_tag = %self.tag,
                    "same-node routing: outbound manager is gone; rejecting connection"
                );
                return;
            };
            match manager.get_handler(&in_tag) {
                Some(handler) => {
                    log::info!(
                        inbound_tag = %in_tag,
                        selected_outbound = %self.tag,
                        reroute_outbound = %handler.tag(),
                        "same-node routing: rerouting to outbound with matching tag"
                    );
                    handler.dispatch(session, link).await;
                }
                None => {
                    log::error!(
                        inbound_tag = %in_tag,
                        outbound_tag = %self.tag,
                        "same-node routing: no outbound handler found for inbound tag; rejecting connection"
                    );
                }
            }
            return;
        }

        let mut link = link;
        if !session.user_key.is_empty() {
            let src_ip = session.source.to_string();

            if !session.destination.is_empty()
                && self
                    .rules
                    .detect(&self.tag, &session.destination, &session.user_key, &src_ip)
            {
                log::warn!(
                    tag = %self.tag,
                    user = %session.user_key,
                    src_ip = %src_ip,
                    dest = %session.destination,
                    "audit rule hit, closing connection"
                );
                return;
            }

            let (bucket, should_limit, reject) = self
                .limiter
                .get_user_bucket(&self.tag, &session.user_key, &src_ip)
                .await;
            if reject {
                log::warn!(
                    tag = %self.tag,
                    user = %session.user_key,
                    src_ip = %src_ip,
                    "device limit exceeded, closing connection"
                );
                return;
            }
            if should_limit {
                if let Some(bucket) = bucket {
                    link = Link {
                        reader: Box::new(RateReader::new(link.reader, Arc::clone(&bucket))),
                        writer: Box::new(RateWriter::new(link.writer, bucket)),
                    };
                }
            }
        }

        self.inner.dispatch(session, link).await;
    }
}

/// Chunked reader over any async byte stream.
pub struct StreamReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LinkReader for StreamReader<R> {
    async fn read_chunk(&mut self) -> std::io::Result<Bytes> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.inner.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// Chunked writer over any async byte stream.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LinkWriter for StreamWriter<W> {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.inner.write_all(&chunk).await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Terminal outbound: connects to the requested destination and relays.
pub struct DirectOutbound {
    tag: String,
    connect_timeout: Duration,
}

impl DirectOutbound {
    pub fn new(tag: String, connect_timeout: Duration) -> Self {
        Self {
            tag,
            connect_timeout,
        }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, session: &mut Session, link: Link) {
        let dest = session.destination.clone();
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&dest))
            .await
        {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                stream
            }
            Ok(Err(e)) => {
                log::warn!(tag = %self.tag, dest = %dest, error = %e, "TCP connect failed");
                return;
            }
            Err(_) => {
                log::warn!(tag = %self.tag, dest = %dest, "TCP connect timeout");
                return;
            }
        };

        let Link {
            mut reader,
            mut writer,
        } = link;
        let (remote_read, remote_write) = stream.into_split();
        let mut remote_reader = StreamReader::new(remote_read);
        let mut remote_writer = StreamWriter::new(remote_write);

        let upload = async {
            loop {
                let chunk = reader.read_chunk().await?;
                if chunk.is_empty() {
                    break;
                }
                remote_writer.write_chunk(chunk).await?;
            }
            remote_writer.shutdown().await
        };
        let download = async {
            loop {
                let chunk = remote_reader.read_chunk().await?;
                if chunk.is_empty() {
                    break;
                }
                writer.write_chunk(chunk).await?;
            }
            writer.shutdown().await
        };

        let (up, down) = tokio::join!(upload, download);
        if let Err(e) = up.and(down) {
            log::debug!(tag = %self.tag, dest = %dest, error = %e, "Relay closed with error");
        }
    }
}
