//! Observability: structured logging and gRPC call tracing.
//!
//! The teacher's observability module also bridges to OpenTelemetry and exports
//! Prometheus metrics; this control plane has no distributed-tracing backend or
//! metrics surface to export to; see `DESIGN.md` for the dependency drop.

pub mod grpc_tracing;
pub mod logging;

pub use grpc_tracing::GrpcTracingLayer;
pub use logging::init_logging;
