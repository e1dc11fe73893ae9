//! Non-aggregated CDS/RDS/LDS/EDS services: each a thin wrapper around the
//! shared SOTW loop fixed to one type URL, sharing the cached-resource store
//! with ADS (SPEC_FULL.md §4.C). No client in this control plane uses them;
//! they exist to satisfy the wire-exact xDS contract in SPEC_FULL.md §6.
//!
//! Grounded on the service-per-type shape of the teacher's (unimplemented)
//! `xds/server.rs`, filled in against `super::stream::run_stream_loop`
//! instead of the teacher's placeholder channels.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;

use super::super::ready::ReadySignal;
use super::super::XdsState;
use crate::snapshot::resources::{CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL};

type ResponseStream = Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;
type DeltaStream = Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

macro_rules! standalone_service {
    ($struct_name:ident, $trait_name:ident, $stream_method:ident, $stream_assoc:ident, $delta_method:ident, $delta_assoc:ident, $type_url:expr, $label:expr) => {
        #[derive(Debug)]
        pub struct $struct_name {
            state: Arc<XdsState>,
            ready: Arc<ReadySignal>,
        }

        impl $struct_name {
            pub fn new(state: Arc<XdsState>, ready: Arc<ReadySignal>) -> Self {
                Self { state, ready }
            }
        }

        #[tonic::async_trait]
        impl $trait_name for $struct_name {
            type $stream_assoc = ResponseStream;
            type $delta_assoc = DeltaStream;

            async fn $stream_method(
                &self,
                request: Request<tonic::Streaming<DiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$stream_assoc>, Status> {
                let stream = super::stream::run_stream_loop(
                    self.state.clone(),
                    self.ready.clone(),
                    request.into_inner(),
                    Some($type_url),
                    $label,
                );
                Ok(Response::new(Box::pin(stream)))
            }

            async fn $delta_method(
                &self,
                _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$delta_assoc>, Status> {
                Err(Status::unimplemented("incremental (Delta) xDS is not served by this control plane"))
            }
        }
    };
}

standalone_service!(
    CdsService,
    ClusterDiscoveryService,
    stream_clusters,
    StreamClustersStream,
    delta_clusters,
    DeltaClustersStream,
    CLUSTER_TYPE_URL,
    "cds"
);

standalone_service!(
    RdsService,
    RouteDiscoveryService,
    stream_routes,
    StreamRoutesStream,
    delta_routes,
    DeltaRoutesStream,
    ROUTE_TYPE_URL,
    "rds"
);

standalone_service!(
    LdsService,
    ListenerDiscoveryService,
    stream_listeners,
    StreamListenersStream,
    delta_listeners,
    DeltaListenersStream,
    LISTENER_TYPE_URL,
    "lds"
);

standalone_service!(
    EdsService,
    EndpointDiscoveryService,
    stream_endpoints,
    StreamEndpointsStream,
    delta_endpoints,
    DeltaEndpointsStream,
    ENDPOINT_TYPE_URL,
    "eds"
);
