//! Agent entry point: load config, build one service per node, run until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};

use node_agent::api::{NodeType, WebPanelClient};
use node_agent::common::cert::FileCertProvider;
use node_agent::common::limiter::Limiter;
use node_agent::common::rule::RuleManager;
use node_agent::config::{AgentConfig, CliArgs};
use node_agent::core::{PortReserveFactory, ServerFactory};
use node_agent::dispatch::OutboundManager;
use node_agent::logger::{init_logger, log};
use node_agent::service::{
    anytls::AnyTlsBackend, classic::ClassicBackend, hysteria2::Hysteria2Backend, tuic::TuicBackend,
    NodeService, ProtocolBackend, Service, TagRegistry,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

struct Shared {
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
    outbounds: Arc<OutboundManager>,
    factory: Arc<dyn ServerFactory>,
    registry: Arc<TagRegistry>,
}

fn build_backend(
    node_type: NodeType,
    entry: &node_agent::config::NodeEntry,
    shared: &Shared,
) -> Result<Arc<dyn ProtocolBackend>> {
    let backend: Arc<dyn ProtocolBackend> = match node_type {
        NodeType::Hysteria2 => Arc::new(Hysteria2Backend),
        NodeType::Tuic => Arc::new(TuicBackend),
        NodeType::AnyTls => Arc::new(AnyTlsBackend),
        t if t.is_classic() => Arc::new(ClassicBackend::new(
            t,
            Arc::clone(&shared.limiter),
            Arc::clone(&shared.rules),
            Arc::clone(&shared.outbounds),
            entry.connect_timeout(),
        )?),
        t => anyhow::bail!("unsupported node type: {t}"),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    let config = AgentConfig::load(&cli.config)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logger(level);

    log::info!(
        api_host = %config.panel.api_host,
        nodes = config.nodes.len(),
        "Starting node agent"
    );

    let shared = Shared {
        limiter: Arc::new(Limiter::new()),
        rules: Arc::new(RuleManager::new()),
        outbounds: Arc::new(OutboundManager::new()),
        factory: Arc::new(PortReserveFactory),
        registry: Arc::new(TagRegistry::new()),
    };
    let cert_provider = Arc::new(FileCertProvider);

    let mut services: Vec<Arc<dyn Service>> = Vec::new();
    for entry in &config.nodes {
        let panel = WebPanelClient::new(config.panel_config(entry))
            .with_context(|| format!("build panel client for node {}", entry.node_id))?;
        let backend = build_backend(entry.node_type, entry, &shared)?;
        let service_config = entry
            .service_config()
            .with_context(|| format!("invalid config for node {}", entry.node_id))?;

        let service = Arc::new(NodeService::new(
            Arc::new(panel),
            service_config,
            backend,
            Arc::clone(&shared.factory),
            cert_provider.clone(),
            Arc::clone(&shared.rules),
            Arc::clone(&shared.registry),
        ));
        services.push(service);
    }

    // A node that fails to start does not abort the others.
    let mut running = 0usize;
    for (entry, service) in config.nodes.iter().zip(&services) {
        match service.start().await {
            Ok(()) => running += 1,
            Err(e) => {
                log::error!(node_id = entry.node_id, error = %e, "Failed to start node service")
            }
        }
    }
    if running == 0 {
        anyhow::bail!("no node service started");
    }
    log::info!(running = running, "Node services started");

    wait_for_shutdown().await;
    log::info!("Shutdown signal received, closing services");

    for service in &services {
        if let Err(e) = service.close().await {
            log::warn!(tag = %service.tag(), error = %e, "Failed to close service");
        }
    }
    log::info!("All services closed");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("setup SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("setup SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => log::info!("SIGINT received"),
            _ = sigterm.recv() => log::info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutdown signal received");
    }
}
