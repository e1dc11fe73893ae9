//! Envoy xDS gRPC server: ADS plus the non-aggregated CDS/RDS/LDS/EDS
//! services sharing one cached-resource store (SPEC_FULL.md §4.C).
//!
//! Grounded on the teacher's `xds/mod.rs` server-builder wiring (TLS-config
//! plumbing dropped: this control plane has no client-mTLS surface, see
//! `DESIGN.md`), generalized to serve the snapshot engine's resources
//! instead of a database-backed repository.

pub(crate) mod ready;
pub mod services;
pub(crate) mod state;

use std::future::Future;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;

use crate::errors::{GatewayError, Result};
use crate::observability::GrpcTracingLayer;

pub use ready::ReadySignal;
pub use state::XdsState;

/// Serve ADS + EDS + CDS + RDS + LDS on one gRPC server until `shutdown`
/// resolves. Mirrors the teacher's `serve_with_shutdown` usage; the max
/// concurrent stream count comes from `state.config.xds.max_concurrent_streams`.
pub async fn serve<F>(state: Arc<XdsState>, ready: Arc<ReadySignal>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state
        .config
        .xds
        .bind_address()
        .parse()
        .map_err(|error| GatewayError::config(format!("invalid xDS bind address: {error}")))?;

    info!(address = %addr, "starting xDS gRPC server");

    let ads = services::AdsService::new(state.clone(), ready.clone());
    let cds = services::CdsService::new(state.clone(), ready.clone());
    let rds = services::RdsService::new(state.clone(), ready.clone());
    let lds = services::LdsService::new(state.clone(), ready.clone());
    let eds = services::EdsService::new(state.clone(), ready.clone());

    Server::builder()
        .concurrency_limit_per_connection(state.config.xds.max_concurrent_streams as usize)
        .layer(GrpcTracingLayer::new())
        .add_service(AggregatedDiscoveryServiceServer::new(ads))
        .add_service(ClusterDiscoveryServiceServer::new(cds))
        .add_service(RouteDiscoveryServiceServer::new(rds))
        .add_service(ListenerDiscoveryServiceServer::new(lds))
        .add_service(EndpointDiscoveryServiceServer::new(eds))
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(|error| GatewayError::transport(format!("xDS server failed: {error}")))?;

    info!("xDS server shut down");
    Ok(())
}
