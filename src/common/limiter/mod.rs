//! Per-inbound limiter for the classic-protocol data path.
//!
//! Each inbound tag owns its node speed limit, user records, a hub of
//! token buckets, a local online-IP map, and optionally a distributed
//! device counter backed by a shared cache.

pub mod global;
pub mod rate;

use std::sync::Arc;

use dashmap::DashMap;

use crate::api::{OnlineUser, UserInfo};
use crate::common::bucket::RateBucket;
use crate::error::{AgentError, Result};
use crate::logger::log;

pub use global::{GlobalDeviceLimit, GlobalDeviceLimitConfig, RedisIpStore, SharedIpStore};

/// Minimum non-zero of node and user limit; 0 means unlimited.
pub fn determine_rate(node_limit: u64, user_limit: u64) -> u64 {
    match (node_limit, user_limit) {
        (0, user) => user,
        (node, 0) => node,
        (node, user) => node.min(user),
    }
}

/// Composite key identifying a user within an inbound.
pub fn build_user_key(tag: &str, email: &str, uid: i64) -> String {
    format!("{tag}|{email}|{uid}")
}

#[derive(Debug, Clone, Copy, Default)]
struct LimiterUser {
    uid: i64,
    speed_limit: u64,
    device_limit: u32,
}

struct InboundInfo {
    node_speed_limit: u64,
    users: DashMap<String, LimiterUser>,
    buckets: DashMap<String, Arc<RateBucket>>,
    /// user key -> (ip -> uid)
    online: DashMap<String, DashMap<String, i64>>,
    global: Option<GlobalDeviceLimit>,
}

pub struct Limiter {
    inbounds: DashMap<String, Arc<InboundInfo>>,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self {
            inbounds: DashMap::new(),
        }
    }

    /// Register (or replace) the limiter state for an inbound tag.
    pub fn add_inbound(
        &self,
        tag: &str,
        node_speed_limit: u64,
        user_list: &[UserInfo],
        global_config: Option<&GlobalDeviceLimitConfig>,
    ) -> Result<()> {
        let global = match global_config {
            Some(cfg) if cfg.enable => Some(GlobalDeviceLimit::with_redis(cfg.clone())?),
            _ => None,
        };

        let info = InboundInfo {
            node_speed_limit,
            users: DashMap::new(),
            buckets: DashMap::new(),
            online: DashMap::new(),
            global,
        };
        for u in user_list {
            info.users.insert(
                build_user_key(tag, &u.email, u.uid),
                LimiterUser {
                    uid: u.uid,
                    speed_limit: u.speed_limit,
                    device_limit: u.device_limit,
                },
            );
        }
        self.inbounds.insert(tag.to_string(), Arc::new(info));
        Ok(())
    }

    /// Merge refreshed user info and retune live buckets in place.
    pub fn update_inbound(&self, tag: &str, user_list: &[UserInfo]) -> Result<()> {
        let info = self
            .inbounds
            .get(tag)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| AgentError::UnknownTag(tag.to_string()))?;

        for u in user_list {
            let user_key = build_user_key(tag, &u.email, u.uid);
            info.users.insert(
                user_key.clone(),
                LimiterUser {
                    uid: u.uid,
                    speed_limit: u.speed_limit,
                    device_limit: u.device_limit,
                },
            );

            let limit = determine_rate(info.node_speed_limit, u.speed_limit);
            if limit > 0 {
                if let Some(bucket) = info.buckets.get(&user_key) {
                    bucket.set_rate(limit);
                    bucket.set_burst(limit);
                }
            } else {
                info.buckets.remove(&user_key);
            }
        }
        Ok(())
    }

    pub fn delete_inbound(&self, tag: &str) {
        self.inbounds.remove(tag);
    }

    /// Drain online devices for a tag, clearing per-user IP submaps and
    /// sweeping buckets of users with no online IPs so churned users release
    /// their memory.
    pub fn get_online_device(&self, tag: &str) -> Result<Vec<OnlineUser>> {
        let info = self
            .inbounds
            .get(tag)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| AgentError::UnknownTag(tag.to_string()))?;

        let idle: Vec<String> = info
            .buckets
            .iter()
            .map(|e| e.key().clone())
            .filter(|key| !info.online.contains_key(key))
            .collect();
        for key in idle {
            info.buckets.remove(&key);
        }

        let mut online_users = Vec::new();
        let keys: Vec<String> = info.online.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, ip_map)) = info.online.remove(&key) {
                for entry in ip_map.iter() {
                    online_users.push(OnlineUser {
                        uid: *entry.value(),
                        ip: entry.key().clone(),
                    });
                }
            }
        }
        Ok(online_users)
    }

    /// Admission check plus bucket lookup for one connection.
    ///
    /// Returns `(bucket, should_limit, reject)`: a rejected connection must
    /// be closed; a returned bucket throttles the session's reader/writer.
    pub async fn get_user_bucket(
        &self,
        tag: &str,
        user_key: &str,
        ip: &str,
    ) -> (Option<Arc<RateBucket>>, bool, bool) {
        let Some(info) = self.inbounds.get(tag).map(|e| Arc::clone(&e)) else {
            log::debug!(tag = tag, "Get inbound limiter information failed");
            return (None, false, false);
        };

        let user = info
            .users
            .get(user_key)
            .map(|u| *u.value())
            .unwrap_or_default();

        // Local device limit: count after insert, undo on overflow.
        {
            let ip_map = info.online.entry(user_key.to_string()).or_default();
            if ip_map.insert(ip.to_string(), user.uid).is_none() {
                let count = ip_map.len() as u32;
                if user.device_limit > 0 && count > user.device_limit {
                    ip_map.remove(ip);
                    return (None, false, true);
                }
            }
        }

        if let Some(global) = &info.global {
            if global.check(user_key, user.uid, ip, user.device_limit).await {
                return (None, false, true);
            }
        }

        let limit = determine_rate(info.node_speed_limit, user.speed_limit);
        if limit == 0 {
            return (None, false, false);
        }
        let bucket = info
            .buckets
            .entry(user_key.to_string())
            .or_insert_with(|| Arc::new(RateBucket::new(limit, limit)))
            .clone();
        (Some(bucket), true, false)
    }
}
