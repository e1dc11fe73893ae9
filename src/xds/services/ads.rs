//! Aggregated Discovery Service (ADS): the only delivery mode the discovery
//! controller actually drives (SPEC_FULL.md §4.C).
//!
//! Grounded on the teacher's `MinimalAggregatedDiscoveryService`, generalized
//! to the shared SOTW loop in `stream.rs` instead of a per-type responder
//! closure, since every type here comes from the same cached-resource store.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::info;

use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};

use super::super::ready::ReadySignal;
use super::super::XdsState;

#[derive(Debug)]
pub struct AdsService {
    state: Arc<XdsState>,
    ready: Arc<ReadySignal>,
}

impl AdsService {
    pub fn new(state: Arc<XdsState>, ready: Arc<ReadySignal>) -> Self {
        Self { state, ready }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;
    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!("new ADS stream connection");
        let stream = super::stream::run_stream_loop(
            self.state.clone(),
            self.ready.clone(),
            request.into_inner(),
            None,
            "ads",
        );
        Ok(Response::new(Box::pin(stream)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("incremental (Delta) xDS is not served by this control plane"))
    }
}
