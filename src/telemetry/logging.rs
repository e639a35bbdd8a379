//! Logging initialization.
//!
//! Per-packet events use `tracing` at debug/trace level so a production
//! deployment pays nothing for them unless a filter enables them.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initializes the logging system.
///
/// `RUST_LOG` takes priority; otherwise `default_filter` is used, falling
/// back to `info`. Safe to call more than once; later calls are no-ops.
pub fn init_logging(default_filter: Option<&str>) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter.unwrap_or("info"))
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());
    let _ = tracing::subscriber::set_global_default(subscriber);
}
