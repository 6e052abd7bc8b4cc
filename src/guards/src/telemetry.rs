//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::MonitoringFlags;

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` wins over the profile's `log_level`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing(flags: &MonitoringFlags) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("routeguards={}", flags.log_level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}
