//! Logging setup for binaries embedding the engine.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the entry point.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install a global subscriber. `RUST_LOG` wins over `level`; an unparsable
/// level falls back to `info`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

pub fn init_from_config(config: &LogConfig) -> anyhow::Result<()> {
    init(&config.level)
}
