//! # xDS Gateway
//!
//! An xDS control plane that programs an Envoy edge proxy directly from
//! Kubernetes state: `core/v1.Service` objects, or AWS App Mesh
//! `VirtualService` objects, projected into a flat internal `Upstream`
//! model and compiled into a checksum-gated Envoy snapshot served over
//! ADS/CDS/RDS/LDS/EDS.
//!
//! ## Architecture
//!
//! ```text
//! Kubernetes watch → source projector → Upstream table → snapshot engine → xDS gRPC server → Envoy
//! ```
//!
//! - **Discovery controllers** ([`discovery`]): watch-indexer-queue loops
//!   over `Service` or `VirtualService` objects.
//! - **Snapshot engine** ([`snapshot`]): builds Envoy resources from the
//!   upstream table and gates publication on both a checksum and an
//!   internal cluster/route consistency check.
//! - **xDS server** ([`xds`]): ADS plus the non-aggregated CDS/RDS/LDS/EDS
//!   services, all backed by one cached-resource store.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod observability;
pub mod snapshot;
pub mod upstream;
pub mod xds;

pub use config::Settings;
pub use errors::{GatewayError, Result};

/// Application version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml.
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_looks_like_semver() {
        let components: Vec<_> = VERSION.split('.').collect();
        assert!(components.len() >= 3, "version should follow semver: {VERSION}");
        assert!(components.iter().all(|part| !part.is_empty()));
        assert_eq!(APP_NAME, "xds-gateway");
    }
}
