//! Periodic control-loop tasks: user monitor, node monitor, cert monitor.
//!
//! All tasks share the configured interval (cert monitor runs at interval
//! x 60) and delay their first real execution by at least one interval after
//! service start to avoid thrashing on boot. Panel failures are logged and
//! skipped for the cycle; state is never rolled back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::common::sysstat;
use crate::logger::log;
use crate::service::node::ServiceInner;

const CERT_INTERVAL_FACTOR: u32 = 60;

/// Format bytes into a human-readable string (KB, MB, GB).
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

pub(crate) fn spawn_monitors(
    svc: &Arc<ServiceInner>,
    shutdown: watch::Receiver<bool>,
    enable_tls: bool,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        spawn_user_monitor(Arc::clone(svc), shutdown.clone()),
        spawn_node_monitor(Arc::clone(svc), shutdown.clone()),
    ];
    if enable_tls {
        handles.push(spawn_cert_monitor(Arc::clone(svc), shutdown));
    }
    handles
}

/// First-cycle delay gate shared by all tasks.
fn warming_up(svc: &ServiceInner, min_age: Duration) -> bool {
    svc.start_at
        .read()
        .map(|t| t.elapsed() < min_age)
        .unwrap_or(true)
}

fn spawn_user_monitor(
    svc: Arc<ServiceInner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(svc.config.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !warming_up(&svc, svc.config.update_interval) {
                        user_monitor_once(&svc).await;
                    }
                }
                _ = shutdown.changed() => {
                    // Final report so the last partial cycle is not lost.
                    report_usage_once(&svc).await;
                    log::debug!("User monitor shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_node_monitor(
    svc: Arc<ServiceInner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(svc.config.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !warming_up(&svc, svc.config.update_interval) {
                        node_monitor_once(&svc).await;
                    }
                }
                _ = shutdown.changed() => {
                    log::debug!("Node monitor shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_cert_monitor(
    svc: Arc<ServiceInner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cert_interval = svc.config.update_interval * CERT_INTERVAL_FACTOR;
        let mut ticker = interval(cert_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !warming_up(&svc, cert_interval) {
                        cert_monitor_once(&svc).await;
                    }
                }
                _ = shutdown.changed() => {
                    log::debug!("Cert monitor shutting down");
                    break;
                }
            }
        }
    })
}

/// One user-monitor cycle: node status, user sync, rule refresh, usage and
/// violation reporting.
pub(crate) async fn user_monitor_once(svc: &Arc<ServiceInner>) {
    let tag = svc.tag.read().clone();

    let status = sysstat::collect();
    if let Err(e) = svc.api.report_node_status(&status).await {
        log::warn!(tag = %tag, error = %e, "Report node status failed");
    }

    match svc.api.get_user_list().await {
        Ok(users) => {
            svc.sync_users(&users);
            svc.backend.on_users_synced(&tag, &users);
            *svc.last_users.write() = users;
        }
        Err(e) if e.is_not_modified() => {}
        Err(e) => {
            log::warn!(tag = %tag, error = %e, "Get user list failed");
            return;
        }
    }

    if !svc.config.disable_get_rules {
        match svc.api.get_node_rules().await {
            Ok(rules) if !rules.is_empty() => svc.rules.update_rule(&tag, rules),
            Ok(_) => {}
            Err(e) if e.is_not_modified() => {}
            Err(e) => log::warn!(tag = %tag, error = %e, "Get rule list failed"),
        }
    }

    report_usage_once(svc).await;

    let results = svc.rules.get_detect_result(&tag);
    if !results.is_empty() {
        match svc.api.report_illegal(&results).await {
            Ok(()) => log::info!(tag = %tag, count = results.len(), "Reported illegal behaviors"),
            Err(e) => log::warn!(tag = %tag, error = %e, "Report illegal behaviors failed"),
        }
    }
}

/// Collect and report traffic and online users. On a failed traffic report
/// the snapshot is merged back for the next cycle; online-user reporting is
/// fire-and-forget.
pub(crate) async fn report_usage_once(svc: &Arc<ServiceInner>) {
    let tag = svc.tag.read().clone();
    let (traffic, mut online, snapshot) = svc.collect_usage();
    online.extend(svc.backend.drain_online(&tag));

    if !traffic.is_empty() && !svc.config.disable_upload_traffic {
        match svc.api.report_user_traffic(&traffic).await {
            Ok(()) => {
                let upload: u64 = traffic.iter().map(|t| t.upload.max(0) as u64).sum();
                let download: u64 = traffic.iter().map(|t| t.download.max(0) as u64).sum();
                log::info!(
                    tag = %tag,
                    users = traffic.len(),
                    upload = %format_bytes(upload),
                    download = %format_bytes(download),
                    "Traffic reported"
                );
            }
            Err(e) => {
                log::warn!(tag = %tag, error = %e, "Report user traffic failed");
                svc.restore_traffic(snapshot);
            }
        }
    }

    if !online.is_empty() {
        if let Err(e) = svc.api.report_online_users(&online).await {
            log::warn!(tag = %tag, error = %e, "Report online users failed");
        }
    }
}

/// One node-monitor cycle: fetch node info and hot-reload on a real change.
pub(crate) async fn node_monitor_once(svc: &Arc<ServiceInner>) {
    let tag = svc.tag.read().clone();
    let node = match svc.api.get_node_info().await {
        Ok(node) => node,
        Err(e) if e.is_not_modified() => return,
        Err(e) => {
            log::warn!(tag = %tag, error = %e, "Get node info failed");
            return;
        }
    };

    if node.node_type != svc.backend.node_type() {
        log::warn!(tag = %tag, node_type = %node.node_type, "Unexpected node type from panel");
        return;
    }

    // Panels bump ETags on metadata churn; only a real config change may
    // trigger a reload.
    if svc.node.read().as_ref() == Some(&node) {
        return;
    }

    if let Err(e) = svc.reload_node(node).await {
        log::warn!(tag = %tag, error = %e, "Node reload failed");
    }
}

/// One cert-monitor cycle: renew ACME certificates and reload on rotation.
pub(crate) async fn cert_monitor_once(svc: &Arc<ServiceInner>) {
    let Some(node) = svc.node.read().clone() else {
        return;
    };
    if !node.enable_tls {
        return;
    }
    let Some(cert) = svc.cert.read().clone() else {
        return;
    };
    if !cert.cert_mode.is_acme() {
        return;
    }

    match svc.cert_provider.renew(&cert).await {
        Ok(true) => {
            log::info!(domain = %cert.cert_domain, "Certificate renewed, reloading server");
            if let Err(e) = svc.reload_node(node).await {
                log::warn!(error = %e, "Certificate reload failed");
            }
        }
        Ok(false) => {}
        Err(e) => log::warn!(error = %e, "Certificate renewal failed"),
    }
}
