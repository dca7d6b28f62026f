//! Tracing setup for ebbtide.
//!
//! Library code only emits `tracing` events; a binary embedding the engine
//! calls this once to get console output.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize console tracing output.
///
/// Respects `RUST_LOG` when set; otherwise logs at `default_level`. Safe to
/// call only once per process.
///
/// # Errors
///
/// - `Box<dyn std::error::Error + Send + Sync>` - A global subscriber is
///   already installed
pub fn init_tracing(
    default_level: Level,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .try_init()?;

    tracing::info!("Tracing initialized at {default_level}");
    Ok(())
}
