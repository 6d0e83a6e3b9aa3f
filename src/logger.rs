use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence when set; otherwise the configured level is
/// applied to this crate only.
pub fn init_logger(level: &str) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(format!("node_agent={level}"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// Access log line for an accepted proxy request.
    pub fn access(remote: &str, proto: &str, dest: &str, tag: &str, uid: Option<i64>) {
        match uid {
            Some(uid) => info!("from {remote} accepted {proto}:{dest} [{tag}] uid: {uid}"),
            None => info!("from {remote} accepted {proto}:{dest} [{tag}]"),
        }
    }
}
