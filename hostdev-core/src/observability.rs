//! Observability infrastructure for the hostdev agent.
//!
//! Thin wrapper around `tracing-subscriber`: log level comes from
//! `RUST_LOG` with an info default, so a node operator can turn on
//! per-module debug output without restarting anything else.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// Must be called once at process startup before any other operations.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;
    Ok(())
}
