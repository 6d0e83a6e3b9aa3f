//! Embedded-server hook implementations over the service state.
//!
//! The authenticator admits sessions and enforces the local device limit;
//! the event logger re-tracks online IPs, writes access logs and runs audit
//! detection; the traffic logger accounts bytes, enforces blocked flags and
//! applies the per-user speed limit outside the service lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::core::{Authenticator, ConnectionId, EventLogger, ServerHooks, TrafficLogger};
use crate::logger::log;
use crate::service::node::ServiceInner;

pub(crate) fn build_hooks(svc: Arc<ServiceInner>) -> ServerHooks {
    ServerHooks {
        authenticator: Arc::new(ServiceAuthenticator {
            svc: Arc::clone(&svc),
        }),
        events: Arc::new(ServiceEventLogger {
            svc: Arc::clone(&svc),
        }),
        traffic: Arc::new(ServiceTrafficLogger { svc }),
    }
}

struct ServiceAuthenticator {
    svc: Arc<ServiceInner>,
}

impl Authenticator for ServiceAuthenticator {
    fn authenticate(&self, addr: SocketAddr, auth: &str, _tx: u64) -> Option<ConnectionId> {
        let host = addr.ip().to_string();

        if auth.is_empty() {
            log::warn!(remote = %host, "Auth failed: empty auth string");
            return None;
        }

        let svc = &self.svc;
        let mut state = svc.state.write();
        let Some(user) = state.users.get(auth).cloned() else {
            log::warn!(remote = %host, auth = %auth, "Auth failed: unknown credential");
            return None;
        };

        let ip_set = state
            .online_ips
            .entry(auth.to_string())
            .or_insert_with(HashSet::new);
        if !ip_set.contains(&host) {
            if user.device_limit > 0 && ip_set.len() as u32 >= user.device_limit {
                log::warn!(
                    uid = user.uid,
                    device_limit = user.device_limit,
                    remote = %host,
                    "User exceeded device limit"
                );
                return None;
            }
            ip_set.insert(host.clone());
        }
        state
            .ip_last_active
            .entry(auth.to_string())
            .or_insert_with(HashMap::new)
            .insert(host, Instant::now());

        // The auth key doubles as the stable connection id.
        Some(auth.to_string())
    }
}

struct ServiceEventLogger {
    svc: Arc<ServiceInner>,
}

impl ServiceEventLogger {
    /// Re-add the remote IP and refresh last-activity; the online set may
    /// have been cleared by the previous report cycle.
    fn track_online(&self, id: &str, host: &str) -> Option<i64> {
        let mut state = self.svc.state.write();
        let Some(user) = state.users.get(id) else {
            return None;
        };
        let uid = user.uid;
        if !host.is_empty() && !id.is_empty() {
            state
                .online_ips
                .entry(id.to_string())
                .or_insert_with(HashSet::new)
                .insert(host.to_string());
            state
                .ip_last_active
                .entry(id.to_string())
                .or_insert_with(HashMap::new)
                .insert(host.to_string(), Instant::now());
        }
        Some(uid)
    }

    fn handle_request(&self, addr: SocketAddr, id: &str, req_addr: &str, proto: &str) {
        let host = addr.ip().to_string();
        let uid = self.track_online(id, &host);

        let tag = self.svc.tag.read().clone();
        log::access(&addr.to_string(), proto, req_addr, &tag, uid);

        let Some(uid) = uid else {
            return;
        };
        if req_addr.is_empty() {
            return;
        }
        if self
            .svc
            .rules
            .detect(&tag, req_addr, &uid.to_string(), &host)
        {
            // The traffic logger consumes the flag and drives disconnection.
            self.svc.state.write().blocked_ids.insert(id.to_string());
            log::warn!(
                remote = %host,
                req_addr = %req_addr,
                uid = uid,
                "Audit rule hit, scheduling disconnect"
            );
        }
    }
}

impl EventLogger for ServiceEventLogger {
    fn connect(&self, addr: SocketAddr, id: &str, _tx: u64) {
        let uid = {
            let state = self.svc.state.read();
            state.users.get(id).map(|u| u.uid)
        };
        match uid {
            Some(uid) => log::info!(remote = %addr, uid = uid, "Client connected"),
            None => log::info!(remote = %addr, "Client connected"),
        }
    }

    fn disconnect(&self, addr: SocketAddr, id: &str, err: Option<&str>) {
        let host = addr.ip().to_string();
        if !id.is_empty() && !host.is_empty() {
            let mut state = self.svc.state.write();
            let drained = state
                .online_ips
                .get_mut(id)
                .map(|set| {
                    set.remove(&host);
                    set.is_empty()
                })
                .unwrap_or(false);
            if drained {
                state.online_ips.remove(id);
            }
            let idle = state
                .ip_last_active
                .get_mut(id)
                .map(|active| {
                    active.remove(&host);
                    active.is_empty()
                })
                .unwrap_or(false);
            if idle {
                state.ip_last_active.remove(id);
            }
        }

        match err {
            Some(err) => log::warn!(remote = %addr, error = %err, "Client disconnected with error"),
            None => log::info!(remote = %addr, "Client disconnected"),
        }
    }

    fn tcp_request(&self, addr: SocketAddr, id: &str, req_addr: &str) {
        self.handle_request(addr, id, req_addr, "tcp");
    }

    fn tcp_error(&self, addr: SocketAddr, _id: &str, req_addr: &str, err: &str) {
        log::warn!(remote = %addr, req_addr = %req_addr, error = %err, "TCP error");
    }

    fn udp_request(&self, addr: SocketAddr, id: &str, _session_id: u32, req_addr: &str) {
        self.handle_request(addr, id, req_addr, "udp");
    }

    fn udp_error(&self, addr: SocketAddr, _id: &str, session_id: u32, err: &str) {
        log::warn!(remote = %addr, session_id = session_id, error = %err, "UDP error");
    }
}

struct ServiceTrafficLogger {
    svc: Arc<ServiceInner>,
}

#[async_trait]
impl TrafficLogger for ServiceTrafficLogger {
    async fn log_traffic(&self, id: &str, tx: u64, rx: u64) -> bool {
        if id.is_empty() {
            return true;
        }

        let bucket = {
            let mut state = self.svc.state.write();

            // A connection flagged by audit is terminated on its next
            // traffic callback; the flag is consumed exactly once.
            if state.blocked_ids.remove(id) {
                log::warn!(id = %id, "Closing connection due to audit rule");
                return false;
            }

            if !state.users.contains_key(id) {
                return true;
            }
            let counter = state.traffic.entry(id.to_string()).or_default();
            counter.upload += tx as i64;
            counter.download += rx as i64;

            state.rate_limiters.get(id).cloned()
        };

        // The token wait must happen outside the service lock.
        if let Some(bucket) = bucket {
            let total = tx + rx;
            if total > 0 {
                bucket.wait_n(total).await;
            }
        }

        true
    }

    fn log_online_state(&self, _id: &str, _online: bool) {
        // Online state is tracked through the authenticator and event logger.
    }
}
