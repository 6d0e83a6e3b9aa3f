//! The per-node service engine.
//!
//! Owns one embedded protocol server, the in-memory user/traffic/online-IP
//! model and the periodic control loop. All per-connection state lives in
//! [`UserState`] behind a single read-write lock; blocking operations (rate
//! waits, cache I/O, panel calls) never happen under it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::{NodeInfo, OnlineUser, PanelClient, UserInfo, UserTraffic};
use crate::common::bucket::RateBucket;
use crate::common::cert::{sync_cert_domain, CertProvider};
use crate::common::limiter::determine_rate;
use crate::common::rule::RuleManager;
use crate::core::{EmbeddedServer, ServerFactory, ServerHooks, ServerSpec};
use crate::error::{AgentError, Result};
use crate::logger::log;
use crate::service::hysteria2::port_hop::PortHopManager;
use crate::service::{
    build_tag, monitor, ProtocolBackend, Service, ServiceConfig, ServiceStatus, TagRegistry,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UserRecord {
    pub uid: i64,
    pub email: String,
    pub device_limit: u32,
    pub speed_limit: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct TrafficCounter {
    pub upload: i64,
    pub download: i64,
}

/// All connection-facing state, guarded by one lock.
#[derive(Default)]
pub(crate) struct UserState {
    /// auth key (UUID or Passwd) -> record
    pub users: HashMap<String, UserRecord>,
    /// auth key -> accumulated bytes since last report
    pub traffic: HashMap<String, TrafficCounter>,
    /// auth key -> online remote IPs
    pub online_ips: HashMap<String, HashSet<String>>,
    /// auth key -> ip -> last activity
    pub ip_last_active: HashMap<String, HashMap<String, Instant>>,
    /// connection ids flagged by audit, consumed by the traffic callback
    pub blocked_ids: HashSet<String>,
    /// auth key -> per-user bucket, shared across keys of the same UID
    pub rate_limiters: HashMap<String, Arc<RateBucket>>,
}

pub(crate) struct RuntimeState {
    pub server: Option<Arc<dyn EmbeddedServer>>,
    pub port_hop: PortHopManager,
}

pub(crate) struct ServiceInner {
    pub api: Arc<dyn PanelClient>,
    pub config: ServiceConfig,
    pub backend: Arc<dyn ProtocolBackend>,
    pub factory: Arc<dyn ServerFactory>,
    pub cert_provider: Arc<dyn CertProvider>,
    pub rules: Arc<RuleManager>,
    pub registry: Arc<TagRegistry>,

    pub tag: RwLock<String>,
    pub node: RwLock<Option<NodeInfo>>,
    pub cert: RwLock<Option<crate::common::cert::CertConfig>>,
    pub last_users: RwLock<Vec<UserInfo>>,
    pub start_at: RwLock<Option<Instant>>,
    pub status: Mutex<ServiceStatus>,
    pub state: RwLock<UserState>,

    /// Reload mutex: serializes server rebuild, port-hop refresh and cert
    /// rotation.
    pub runtime: AsyncMutex<RuntimeState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One node service; construct per configured node and drive through
/// [`Service`].
pub struct NodeService {
    inner: Arc<ServiceInner>,
}

impl NodeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn PanelClient>,
        config: ServiceConfig,
        backend: Arc<dyn ProtocolBackend>,
        factory: Arc<dyn ServerFactory>,
        cert_provider: Arc<dyn CertProvider>,
        rules: Arc<RuleManager>,
        registry: Arc<TagRegistry>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(ServiceInner {
                api,
                config,
                backend,
                factory,
                cert_provider,
                rules,
                registry,
                tag: RwLock::new(String::new()),
                node: RwLock::new(None),
                cert: RwLock::new(None),
                last_users: RwLock::new(Vec::new()),
                start_at: RwLock::new(None),
                status: Mutex::new(ServiceStatus::New),
                state: RwLock::new(UserState::default()),
                runtime: AsyncMutex::new(RuntimeState {
                    server: None,
                    port_hop: PortHopManager::new(),
                }),
                shutdown_tx,
                shutdown_rx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ServiceInner> {
        &self.inner
    }
}

#[async_trait]
impl Service for NodeService {
    fn tag(&self) -> String {
        self.inner.tag.read().clone()
    }

    async fn start(&self) -> Result<()> {
        let result = ServiceInner::start(&self.inner).await;
        if result.is_err() {
            *self.inner.status.lock() = ServiceStatus::Closed;
            let tag = self.inner.tag.read().clone();
            if !tag.is_empty() {
                self.inner.registry.release(&tag);
            }
        }
        result
    }

    async fn close(&self) -> Result<()> {
        ServiceInner::close(&self.inner).await
    }
}

impl ServiceInner {
    fn check_node(&self, node: &NodeInfo) -> Result<()> {
        let expected = self.backend.node_type();
        if node.node_type != expected {
            return Err(AgentError::Config(format!(
                "{expected} service can only be used with {expected} node, got {}",
                node.node_type
            )));
        }
        if node.port == 0 {
            return Err(AgentError::Config("server port must > 0".to_string()));
        }
        self.backend.validate(node, &self.config)
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != ServiceStatus::New {
                return Err(AgentError::Config("service already started".to_string()));
            }
            *status = ServiceStatus::Running;
        }

        let client_info = self.api.describe();
        let node = self.api.get_node_info().await?;
        self.check_node(&node)?;

        let tag = build_tag(
            node.node_type,
            self.config.listen_ip,
            node.port,
            node.node_id,
        );
        self.registry.claim(&tag)?;
        *self.tag.write() = tag.clone();
        *self.node.write() = Some(node.clone());
        *self.cert.write() = self.config.cert.clone();
        *self.start_at.write() = Some(Instant::now());

        let users = self.api.get_user_list().await?;
        if users.is_empty() {
            log::warn!(tag = %tag, "No users found for node, authentication may fail");
        } else {
            let mut preview = users[0].uuid.clone();
            if preview.len() > 8 {
                preview.truncate(8);
                preview.push_str("...");
            }
            log::info!(
                tag = %tag,
                count = users.len(),
                first_uuid = %preview,
                "Syncing users for node"
            );
        }
        self.sync_users(&users);
        self.backend.on_started(&tag, &node, &users, &self.config)?;
        *self.last_users.write() = users;

        if !self.config.disable_get_rules {
            match self.api.get_node_rules().await {
                Ok(rules) if !rules.is_empty() => self.rules.update_rule(&tag, rules),
                Ok(_) => {}
                Err(e) => log::warn!(tag = %tag, error = %e, "Get rule list failed"),
            }
        }

        {
            let mut rt = self.runtime.lock().await;
            rt.port_hop
                .refresh(self.backend.port_hop_rules(&node))
                .await;
            self.rebuild_server_locked(&mut rt, &node, &tag).await?;
        }

        let handles = monitor::spawn_monitors(self, self.shutdown_rx.clone(), node.enable_tls);
        self.tasks.lock().extend(handles);

        log::info!(
            tag = %tag,
            api_host = %client_info.api_host,
            node_id = client_info.node_id,
            listen = %self.config.listen_ip,
            port = node.port,
            "Node started"
        );
        Ok(())
    }

    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status == ServiceStatus::Closed {
                return Ok(());
            }
            *status = ServiceStatus::Closed;
        }

        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let mut rt = self.runtime.lock().await;
        rt.port_hop.clear().await;
        if let Some(server) = rt.server.take() {
            if let Err(e) = server.close().await {
                log::warn!(error = %e, "Failed to close embedded server");
            }
        }
        drop(rt);

        let tag = self.tag.read().clone();
        if !tag.is_empty() {
            self.backend.on_closed(&tag);
            self.rules.remove_tag(&tag);
            self.registry.release(&tag);
        }
        log::info!(tag = %tag, "Node closed");
        Ok(())
    }

    /// Replace node info and rebuild the embedded server in place. Port-hop
    /// rules are recomputed and replaced before the new server starts.
    pub(crate) async fn reload_node(self: &Arc<Self>, node: NodeInfo) -> Result<()> {
        self.check_node(&node)?;

        {
            let mut status = self.status.lock();
            if *status != ServiceStatus::Running {
                return Err(AgentError::Config(
                    "service is not running, refusing reload".to_string(),
                ));
            }
            *status = ServiceStatus::Reloading;
        }
        let _restore = scopeguard::guard(self, |svc| {
            let mut status = svc.status.lock();
            if *status == ServiceStatus::Reloading {
                *status = ServiceStatus::Running;
            }
        });

        let mut rt = self.runtime.lock().await;
        let old = self.node.write().replace(node.clone());

        if node.enable_tls {
            let mut cert = self.cert.write();
            if let Some(cert) = cert.as_mut() {
                sync_cert_domain(cert, &node, old.as_ref());
            }
        }

        rt.port_hop
            .refresh(self.backend.port_hop_rules(&node))
            .await;

        let tag = self.tag.read().clone();
        self.rebuild_server_locked(&mut rt, &node, &tag).await?;
        drop(rt);

        let users = self.last_users.read().clone();
        self.backend.on_reloaded(&tag, &node, &users, &self.config);

        log::info!(tag = %tag, port = node.port, "Node reloaded");
        Ok(())
    }

    async fn rebuild_server_locked(
        self: &Arc<Self>,
        rt: &mut RuntimeState,
        node: &NodeInfo,
        tag: &str,
    ) -> Result<()> {
        if let Some(old) = rt.server.take() {
            if let Err(e) = old.close().await {
                log::warn!(tag = %tag, error = %e, "Failed to close old embedded server");
            }
        }

        let cert = if node.enable_tls {
            let cert_config = self
                .cert
                .read()
                .clone()
                .ok_or_else(|| AgentError::Config("cert config is required".to_string()))?;
            Some(self.cert_provider.ensure(&cert_config).await?)
        } else {
            None
        };

        let spec = ServerSpec {
            tag: tag.to_string(),
            listen: SocketAddr::new(self.config.listen_ip, node.port),
            node: node.clone(),
            cert,
        };
        let server = self.factory.build(spec, self.hooks()).await?;
        rt.server = Some(Arc::clone(&server));

        let serve_tag = tag.to_string();
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = serving.serve().await {
                log::error!(tag = %serve_tag, error = %e, "Embedded server serve error");
            }
        });
        Ok(())
    }

    fn hooks(self: &Arc<Self>) -> ServerHooks {
        super::hooks::build_hooks(Arc::clone(self))
    }

    /// Rebuild the user map from a fresh panel list. Atomic per call under
    /// the service write lock.
    pub(crate) fn sync_users(&self, list: &[UserInfo]) {
        let node_limit = self
            .node
            .read()
            .as_ref()
            .map(|n| n.speed_limit)
            .unwrap_or(0);

        let mut state = self.state.write();
        let mut new_users: HashMap<String, UserRecord> = HashMap::with_capacity(list.len());
        let mut new_limiters: HashMap<String, Arc<RateBucket>> = HashMap::new();

        for u in list {
            // Primary auth key is the UUID; Passwd is a fallback for panels
            // that authenticate on the password field.
            let keys: Vec<&str> = [u.uuid.as_str(), u.passwd.as_str()]
                .into_iter()
                .filter(|k| !k.is_empty())
                .collect();
            let record = UserRecord {
                uid: u.uid,
                email: u.email.clone(),
                device_limit: u.device_limit,
                speed_limit: u.speed_limit,
            };

            let limit = determine_rate(node_limit, u.speed_limit);
            let mut bucket: Option<Arc<RateBucket>> = None;
            if limit > 0 {
                for key in &keys {
                    if let Some(existing) = state.rate_limiters.get(*key) {
                        existing.set_rate(limit);
                        existing.set_burst(limit);
                        bucket = Some(Arc::clone(existing));
                        break;
                    }
                }
                if bucket.is_none() {
                    bucket = Some(Arc::new(RateBucket::new(limit, limit)));
                }
            }

            for key in keys {
                if !new_users.contains_key(key) {
                    new_users.insert(key.to_string(), record.clone());
                }
                if let Some(bucket) = &bucket {
                    new_limiters.insert(key.to_string(), Arc::clone(bucket));
                }
                state.traffic.entry(key.to_string()).or_default();
            }
        }

        state.users = new_users;
        state.rate_limiters = new_limiters;

        let UserState {
            users,
            online_ips,
            ip_last_active,
            blocked_ids,
            ..
        } = &mut *state;
        online_ips.retain(|key, _| users.contains_key(key));
        ip_last_active.retain(|key, _| users.contains_key(key));
        blocked_ids.retain(|key| users.contains_key(key));
    }

    /// Snapshot non-zero traffic counters and drain the online-IP set.
    ///
    /// Counters are reset under the lock; the returned snapshot lets the
    /// caller restore them if reporting fails.
    pub(crate) fn collect_usage(
        &self,
    ) -> (
        Vec<UserTraffic>,
        Vec<OnlineUser>,
        HashMap<String, TrafficCounter>,
    ) {
        let mut state = self.state.write();
        let UserState {
            users,
            traffic,
            online_ips,
            ip_last_active,
            ..
        } = &mut *state;

        let mut snapshot = HashMap::new();
        let mut report = Vec::new();
        for (key, counter) in traffic.iter_mut() {
            let Some(user) = users.get(key) else {
                continue;
            };
            if counter.upload == 0 && counter.download == 0 {
                continue;
            }
            snapshot.insert(key.clone(), *counter);
            report.push(UserTraffic {
                uid: user.uid,
                email: user.email.clone(),
                upload: counter.upload,
                download: counter.download,
            });
            counter.upload = 0;
            counter.download = 0;
        }

        let mut online = Vec::new();
        for (key, ips) in online_ips.iter() {
            let Some(user) = users.get(key) else {
                continue;
            };
            for ip in ips {
                online.push(OnlineUser {
                    uid: user.uid,
                    ip: ip.clone(),
                });
            }
        }

        // Any IP not re-observed within the next cycle is considered offline.
        online_ips.clear();
        ip_last_active.clear();

        (report, online, snapshot)
    }

    /// Merge a snapshot back after a failed report so usage is not lost.
    pub(crate) fn restore_traffic(&self, snapshot: HashMap<String, TrafficCounter>) {
        if snapshot.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for (key, snap) in snapshot {
            let counter = state.traffic.entry(key).or_default();
            counter.upload += snap.upload;
            counter.download += snap.download;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_for_state_tests() -> Arc<ServiceInner> {
        testutil::service_builder().build_inner()
    }

    fn user(uid: i64, uuid: &str, passwd: &str, speed: u64, devices: u32) -> UserInfo {
        UserInfo {
            uid,
            email: format!("{uid}@example.com"),
            uuid: uuid.to_string(),
            passwd: passwd.to_string(),
            speed_limit: speed,
            device_limit: devices,
        }
    }

    #[test]
    fn test_sync_users_builds_both_auth_keys() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "pass-1", 0, 0)]);

        let state = svc.state.read();
        assert_eq!(state.users.len(), 2);
        assert_eq!(state.users["uuid-1"].uid, 1);
        assert_eq!(state.users["pass-1"].uid, 1);
        assert!(state.traffic.contains_key("uuid-1"));
        assert!(state.traffic.contains_key("pass-1"));
    }

    #[test]
    fn test_sync_users_skips_empty_fallback_key() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);

        let state = svc.state.read();
        assert_eq!(state.users.len(), 1);
        assert!(state.users.contains_key("uuid-1"));
    }

    #[test]
    fn test_sync_users_shares_limiter_across_keys() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "pass-1", 100, 0)]);

        let state = svc.state.read();
        let a = state.rate_limiters.get("uuid-1").unwrap();
        let b = state.rate_limiters.get("pass-1").unwrap();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.rate(), 100);
    }

    #[test]
    fn test_sync_users_reuses_and_retunes_limiter() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 100, 0)]);
        let original = Arc::clone(svc.state.read().rate_limiters.get("uuid-1").unwrap());

        svc.sync_users(&[user(1, "uuid-1", "", 200, 0)]);
        let after = Arc::clone(svc.state.read().rate_limiters.get("uuid-1").unwrap());
        assert!(Arc::ptr_eq(&original, &after));
        assert_eq!(after.rate(), 200);
        assert_eq!(after.burst(), 200);
    }

    #[test]
    fn test_sync_users_no_limiter_when_unlimited() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);
        assert!(svc.state.read().rate_limiters.is_empty());
    }

    #[test]
    fn test_sync_users_purges_removed_user_state() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0), user(2, "uuid-2", "", 0, 0)]);
        {
            let mut state = svc.state.write();
            state
                .online_ips
                .entry("uuid-2".to_string())
                .or_default()
                .insert("1.1.1.1".to_string());
            state
                .ip_last_active
                .entry("uuid-2".to_string())
                .or_default()
                .insert("1.1.1.1".to_string(), Instant::now());
            state.blocked_ids.insert("uuid-2".to_string());
        }

        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);
        let state = svc.state.read();
        assert!(!state.users.contains_key("uuid-2"));
        assert!(!state.online_ips.contains_key("uuid-2"));
        assert!(!state.ip_last_active.contains_key("uuid-2"));
        assert!(!state.blocked_ids.contains("uuid-2"));
    }

    #[test]
    fn test_sync_users_same_list_is_idempotent() {
        let svc = service_for_state_tests();
        let list = vec![user(1, "uuid-1", "pass-1", 100, 2)];
        svc.sync_users(&list);
        let users_before = svc.state.read().users.clone();
        let bucket_before = Arc::clone(svc.state.read().rate_limiters.get("uuid-1").unwrap());

        svc.sync_users(&list);
        let state = svc.state.read();
        assert_eq!(state.users, users_before);
        assert!(Arc::ptr_eq(
            &bucket_before,
            state.rate_limiters.get("uuid-1").unwrap()
        ));
    }

    #[test]
    fn test_collect_usage_snapshots_and_resets() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);
        {
            let mut state = svc.state.write();
            let counter = state.traffic.get_mut("uuid-1").unwrap();
            counter.upload = 100;
            counter.download = 200;
            state
                .online_ips
                .entry("uuid-1".to_string())
                .or_default()
                .insert("1.1.1.1".to_string());
        }

        let (report, online, snapshot) = svc.collect_usage();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].upload, 100);
        assert_eq!(report[0].download, 200);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].ip, "1.1.1.1");
        assert_eq!(snapshot["uuid-1"].upload, 100);

        let state = svc.state.read();
        assert_eq!(state.traffic["uuid-1"], TrafficCounter::default());
        assert!(state.online_ips.is_empty());
        assert!(state.ip_last_active.is_empty());
    }

    #[test]
    fn test_collect_usage_skips_zero_counters() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);
        let (report, online, snapshot) = svc.collect_usage();
        assert!(report.is_empty());
        assert!(online.is_empty());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_collect_then_restore_is_identity() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);
        {
            let mut state = svc.state.write();
            let counter = state.traffic.get_mut("uuid-1").unwrap();
            counter.upload = 100;
            counter.download = 200;
        }

        let (_, _, snapshot) = svc.collect_usage();
        svc.restore_traffic(snapshot);

        let state = svc.state.read();
        assert_eq!(
            state.traffic["uuid-1"],
            TrafficCounter {
                upload: 100,
                download: 200
            }
        );
    }

    #[test]
    fn test_restore_merges_with_new_traffic() {
        let svc = service_for_state_tests();
        svc.sync_users(&[user(1, "uuid-1", "", 0, 0)]);
        {
            let mut state = svc.state.write();
            state.traffic.get_mut("uuid-1").unwrap().upload = 100;
        }
        let (_, _, snapshot) = svc.collect_usage();

        // New traffic arrives while the report is in flight.
        {
            let mut state = svc.state.write();
            state.traffic.get_mut("uuid-1").unwrap().upload = 30;
        }
        svc.restore_traffic(snapshot);
        assert_eq!(svc.state.read().traffic["uuid-1"].upload, 130);
    }
}
