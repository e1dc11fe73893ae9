//! gRPC tracing Tower layer.
//!
//! Wraps every incoming gRPC call in a span carrying the method path, so stream
//! lifecycle and ACK/NACK handling is traceable per connected Envoy node.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::codegen::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

#[derive(Clone, Default)]
pub struct GrpcTracingLayer;

impl GrpcTracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for GrpcTracingLayer {
    type Service = GrpcTracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcTracingService { inner }
    }
}

#[derive(Clone)]
pub struct GrpcTracingService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcTracingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let (service, method) = parse_grpc_path(request.uri().path());
        let span = info_span!(
            "grpc.server",
            rpc.service = %service,
            rpc.method = %method,
            grpc.status = tracing::field::Empty,
            grpc.duration_ms = tracing::field::Empty,
        );

        let mut inner = self.inner.clone();
        Box::pin(
            async move {
                let start = Instant::now();
                let result = inner.call(request).await;
                tracing::Span::current().record("grpc.duration_ms", start.elapsed().as_millis() as f64);
                tracing::Span::current()
                    .record("grpc.status", if result.is_ok() { "OK" } else { "ERROR" });
                result
            }
            .instrument(span),
        )
    }
}

/// gRPC paths are formatted as `/package.ServiceName/MethodName`.
fn parse_grpc_path(path: &str) -> (String, String) {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match parts.as_slice() {
        [service, method] => (service.to_string(), method.to_string()),
        [single] if !single.is_empty() => (single.to_string(), "unknown".to_string()),
        _ => ("unknown".to_string(), "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_grpc_path() {
        let (service, method) = parse_grpc_path(
            "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources",
        );
        assert_eq!(service, "envoy.service.discovery.v3.AggregatedDiscoveryService");
        assert_eq!(method, "StreamAggregatedResources");
    }

    #[test]
    fn parses_empty_path() {
        let (service, method) = parse_grpc_path("/");
        assert_eq!(service, "unknown");
        assert_eq!(method, "unknown");
    }
}
