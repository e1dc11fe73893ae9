//! Structured logging initialization.
//!
//! Mirrors the teacher's `tracing_subscriber::fmt` setup in `main.rs`, pulled out into
//! its own function so the CLI can call it once before any subsystem logs.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG` when set; otherwise defaults to info-level logs for this crate
/// and `tonic`/`kube`, which is the minimum needed to see stream lifecycle and
/// reconciliation activity without drowning in dependency noise.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("xds_gateway=info,tonic=info,kube=info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
