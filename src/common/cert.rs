//! Certificate configuration and the provider seam.
//!
//! ACME issuance lives behind [`CertProvider`]; the in-tree implementation
//! covers the "file" mode, where certificate and key already exist on disk
//! (possibly at paths auto-derived from the panel SNI).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::api::NodeInfo;
use crate::error::{AgentError, Result};

/// Directory used when file-mode paths are auto-derived from the SNI.
pub const CERT_DIR: &str = "/etc/node-agent/cert";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMode {
    #[default]
    File,
    Dns,
    Http,
    Tls,
}

impl CertMode {
    pub fn is_acme(&self) -> bool {
        matches!(self, CertMode::Dns | CertMode::Http | CertMode::Tls)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CertConfig {
    #[serde(default)]
    pub cert_mode: CertMode,
    #[serde(default)]
    pub cert_domain: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub email: String,
}

/// Keep the certificate domain in sync with the panel SNI on reload.
///
/// A domain the operator customised is left untouched; only an empty domain
/// or one that tracked the previous SNI/Host is re-derived. In file mode with
/// no explicit paths, cert and key locations are derived under [`CERT_DIR`].
pub fn sync_cert_domain(cert: &mut CertConfig, node: &NodeInfo, old: Option<&NodeInfo>) {
    let sni = if node.sni.is_empty() {
        node.host.as_str()
    } else {
        node.sni.as_str()
    };
    if sni.is_empty() {
        return;
    }

    let (old_sni, old_host) = old.map(|o| (o.sni.as_str(), o.host.as_str())).unwrap_or(("", ""));
    let tracked = cert.cert_domain.is_empty()
        || cert.cert_domain == old_sni
        || cert.cert_domain == old_host;

    match cert.cert_mode {
        CertMode::File => {
            if cert.cert_file.is_empty() && cert.key_file.is_empty() {
                cert.cert_domain = sni.to_string();
                cert.cert_file = format!("{CERT_DIR}/{sni}.cert");
                cert.key_file = format!("{CERT_DIR}/{sni}.key");
            } else if tracked {
                cert.cert_domain = sni.to_string();
            }
        }
        CertMode::Dns | CertMode::Http | CertMode::Tls => {
            if tracked {
                cert.cert_domain = sni.to_string();
            }
        }
    }
}

/// Certificate acquisition and renewal seam.
#[async_trait]
pub trait CertProvider: Send + Sync {
    /// Resolve (and if necessary issue) the certificate and key paths.
    async fn ensure(&self, config: &CertConfig) -> Result<(PathBuf, PathBuf)>;

    /// Attempt renewal; returns true when the certificate was actually
    /// rotated on disk and the server needs a reload.
    async fn renew(&self, config: &CertConfig) -> Result<bool>;
}

/// File-mode provider: certificates are managed outside the agent.
pub struct FileCertProvider;

#[async_trait]
impl CertProvider for FileCertProvider {
    async fn ensure(&self, config: &CertConfig) -> Result<(PathBuf, PathBuf)> {
        match config.cert_mode {
            CertMode::File => {
                if config.cert_file.is_empty() || config.key_file.is_empty() {
                    return Err(AgentError::Config(
                        "cert file path or key file path not exist".to_string(),
                    ));
                }
                Ok((
                    PathBuf::from(&config.cert_file),
                    PathBuf::from(&config.key_file),
                ))
            }
            mode => Err(AgentError::Config(format!(
                "cert mode {mode:?} requires an ACME-capable cert provider"
            ))),
        }
    }

    async fn renew(&self, _config: &CertConfig) -> Result<bool> {
        // Nothing to rotate; files are replaced out of band.
        Ok(false)
    }
}
