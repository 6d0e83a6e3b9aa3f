//! Distributed device counting over a two-tier cache.
//!
//! Tier one is an in-process TTL map; tier two is a Redis-style shared
//! key-value store that all nodes of the panel write to. The local decision
//! in the limiter is authoritative; this overlay is advisory and fails open
//! on cache errors or timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::{AgentError, Result};
use crate::logger::log;

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalDeviceLimitConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_redis_addr")]
    pub redis_addr: String,
    #[serde(default)]
    pub redis_username: String,
    #[serde(default)]
    pub redis_password: String,
    #[serde(default)]
    pub redis_db: u32,
    /// Cache operation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Entry expiry in seconds, applied to both tiers.
    #[serde(default = "default_expiry")]
    pub expiry: u64,
}

fn default_redis_addr() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_expiry() -> u64 {
    60
}

/// Cross-node IP set store. Keys are limiter user keys; values map IP to UID.
#[async_trait]
pub trait SharedIpStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<HashMap<String, i64>>>;

    async fn set(
        &self,
        key: &str,
        value: &HashMap<String, i64>,
        ttl: Duration,
    ) -> anyhow::Result<()>;
}

/// Redis-backed shared store. The connection is established lazily so that
/// limiter registration stays synchronous.
pub struct RedisIpStore {
    client: redis::Client,
    conn: tokio::sync::OnceCell<redis::aio::ConnectionManager>,
}

impl RedisIpStore {
    pub fn new(config: &GlobalDeviceLimitConfig) -> Result<Self> {
        let auth = if config.redis_password.is_empty() {
            String::new()
        } else if config.redis_username.is_empty() {
            format!(":{}@", config.redis_password)
        } else {
            format!("{}:{}@", config.redis_username, config.redis_password)
        };
        let url = format!("redis://{}{}/{}", auth, config.redis_addr, config.redis_db);
        let client = redis::Client::open(url)
            .map_err(|e| AgentError::Config(format!("invalid redis config: {e}")))?;
        Ok(Self {
            client,
            conn: tokio::sync::OnceCell::new(),
        })
    }

    async fn conn(&self) -> anyhow::Result<redis::aio::ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| redis::aio::ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl SharedIpStore for RedisIpStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<HashMap<String, i64>>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &HashMap<String, i64>,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(value)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct GlobalDeviceLimit {
    config: GlobalDeviceLimitConfig,
    local: Arc<DashMap<String, (Instant, HashMap<String, i64>)>>,
    store: Arc<dyn SharedIpStore>,
}

impl GlobalDeviceLimit {
    pub fn new(config: GlobalDeviceLimitConfig, store: Arc<dyn SharedIpStore>) -> Self {
        Self {
            config,
            local: Arc::new(DashMap::new()),
            store,
        }
    }

    pub fn with_redis(config: GlobalDeviceLimitConfig) -> Result<Self> {
        let store = Arc::new(RedisIpStore::new(&config)?);
        Ok(Self::new(config, store))
    }

    fn local_get(&self, key: &str) -> Option<HashMap<String, i64>> {
        let entry = self.local.get(key)?;
        let (expires, map) = entry.value();
        if Instant::now() >= *expires {
            drop(entry);
            self.local.remove(key);
            return None;
        }
        Some(map.clone())
    }

    fn local_put(&self, key: &str, map: HashMap<String, i64>) {
        let expires = Instant::now() + Duration::from_secs(self.config.expiry.max(1));
        self.local.insert(key.to_string(), (expires, map));
    }

    fn spawn_push(&self, key: String, map: HashMap<String, i64>) {
        let store = Arc::clone(&self.store);
        let timeout = Duration::from_secs(self.config.timeout.max(1));
        let ttl = Duration::from_secs(self.config.expiry.max(1));
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.set(&key, &map, ttl)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!(key = %key, error = %e, "Cache service push failed"),
                Err(_) => log::warn!(key = %key, "Cache service push timed out"),
            }
        });
    }

    /// Returns true when the connection must be rejected.
    ///
    /// Fail-open: any cache error or timeout allows the connection, since
    /// local enforcement has already been applied.
    pub async fn check(&self, user_key: &str, uid: i64, ip: &str, device_limit: u32) -> bool {
        let cached = self.local_get(user_key);
        let ip_map = match cached {
            Some(map) => Some(map),
            None => {
                let timeout = Duration::from_secs(self.config.timeout.max(1));
                match tokio::time::timeout(timeout, self.store.get(user_key)).await {
                    Ok(Ok(found)) => {
                        if let Some(map) = &found {
                            self.local_put(user_key, map.clone());
                        }
                        found
                    }
                    Ok(Err(e)) => {
                        log::warn!(key = user_key, error = %e, "Cache service read failed");
                        return false;
                    }
                    Err(_) => {
                        log::warn!(key = user_key, "Cache service read timed out");
                        return false;
                    }
                }
            }
        };

        match ip_map {
            None => {
                self.spawn_push(
                    user_key.to_string(),
                    HashMap::from([(ip.to_string(), uid)]),
                );
                false
            }
            Some(mut map) => {
                // Cardinality is checked before inserting the current IP: the
                // overlay is advisory and this avoids double-rejecting at the
                // boundary when local state and cache disagree.
                if device_limit > 0 && map.len() > device_limit as usize {
                    return true;
                }
                if !map.contains_key(ip) {
                    map.insert(ip.to_string(), uid);
                    self.local_put(user_key, map.clone());
                    self.spawn_push(user_key.to_string(), map);
                }
                false
            }
        }
    }
}
