//! HTTP panel client.
//!
//! Conditional GET endpoints carry an `If-None-Match` header with the last
//! seen ETag; a 304 answer maps to the typed `NotModified` sentinel so the
//! control loop can treat it as a no-op success.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    ClientInfo, DetectResult, DetectRule, NodeInfo, NodeStatus, NodeType, OnlineUser, PanelClient,
    PanelError, UserInfo, UserTraffic,
};
use crate::logger::log;

/// Connection settings for one panel node.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub api_host: String,
    pub key: String,
    pub node_id: i64,
    pub node_type: NodeType,
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

pub struct WebPanelClient {
    http: reqwest::Client,
    config: PanelConfig,
    node_etag: Mutex<Option<String>>,
    user_etag: Mutex<Option<String>>,
    rule_etag: Mutex<Option<String>>,
}

impl WebPanelClient {
    pub fn new(config: PanelConfig) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            node_etag: Mutex::new(None),
            user_etag: Mutex::new(None),
            rule_etag: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/server/node/{}/{}",
            self.config.api_host.trim_end_matches('/'),
            self.config.node_id,
            path
        )
    }

    /// Conditional GET with per-endpoint ETag tracking.
    async fn get_cached<T: DeserializeOwned>(
        &self,
        path: &str,
        etag: &Mutex<Option<String>>,
        not_modified: fn() -> PanelError,
    ) -> Result<T, PanelError> {
        let mut req = self
            .http
            .get(self.url(path))
            .query(&[
                ("token", self.config.key.as_str()),
                ("node_type", self.config.node_type.as_str()),
            ]);
        if let Some(tag) = etag.lock().clone() {
            req = req.header(reqwest::header::IF_NONE_MATCH, tag);
        }

        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Err(not_modified());
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::Status { status, body });
        }

        let new_etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *etag.lock() = new_etag;

        let body = resp.text().await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| PanelError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, payload: &T) -> Result<(), PanelError> {
        let resp = self
            .http
            .post(self.url(path))
            .query(&[
                ("token", self.config.key.as_str()),
                ("node_type", self.config.node_type.as_str()),
            ])
            .json(payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl PanelClient for WebPanelClient {
    fn describe(&self) -> ClientInfo {
        ClientInfo {
            api_host: self.config.api_host.clone(),
            node_id: self.config.node_id,
            key: self.config.key.clone(),
            node_type: self.config.node_type,
        }
    }

    async fn get_node_info(&self) -> Result<NodeInfo, PanelError> {
        let info: NodeInfo = self
            .get_cached("info", &self.node_etag, PanelError::not_modified_node)
            .await?;
        log::debug!(
            node_id = info.node_id,
            port = info.port,
            node_type = %info.node_type,
            "Node info fetched"
        );
        Ok(info)
    }

    async fn get_user_list(&self) -> Result<Vec<UserInfo>, PanelError> {
        let users: Vec<UserInfo> = self
            .get_cached("users", &self.user_etag, PanelError::not_modified_users)
            .await?;
        log::debug!(count = users.len(), "Users fetched");
        Ok(users)
    }

    async fn get_node_rules(&self) -> Result<Vec<DetectRule>, PanelError> {
        let rules: Vec<DetectRule> = self
            .get_cached("rules", &self.rule_etag, PanelError::not_modified_rules)
            .await?;
        log::debug!(count = rules.len(), "Rules fetched");
        Ok(rules)
    }

    async fn report_node_status(&self, status: &NodeStatus) -> Result<(), PanelError> {
        self.post("status", status).await
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<(), PanelError> {
        if traffic.is_empty() {
            return Ok(());
        }
        self.post("traffic", traffic).await
    }

    async fn report_online_users(&self, users: &[OnlineUser]) -> Result<(), PanelError> {
        if users.is_empty() {
            return Ok(());
        }
        self.post("online", users).await
    }

    async fn report_illegal(&self, results: &[DetectResult]) -> Result<(), PanelError> {
        if results.is_empty() {
            return Ok(());
        }
        self.post("illegal", results).await
    }
}
