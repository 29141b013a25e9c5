//! Observability infrastructure: tracing and metrics.
//!
//! Components log through `tracing` and count through the `metrics` facade.
//! Binaries call [`init`] once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global subscriber at `level` and register core metrics.
///
/// `RUST_LOG`, when set, takes precedence over `level`. Logs go to stderr so
/// stdout stays free for command output.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init(level: tracing::Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .try_init()?;

    metrics::register_core_metrics();
    tracing::debug!("Observability initialized at level {}", level);
    Ok(())
}
