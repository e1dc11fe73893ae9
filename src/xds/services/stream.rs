//! Shared SOTW (State of the World) ADS stream loop.
//!
//! Grounded on the teacher's `xds/services/stream.rs::run_stream_loop`: same
//! ACK/NACK detection, per-type-URL subscription tracking, and push-on-update
//! via the broadcast channel. Trimmed of the Delta xDS variant (not part of
//! this control plane's wire contract) and adapted to trip the xDS server's
//! ready signal on the first request of any kind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::Status;
use tracing::{debug, error, info, warn};

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};

use super::super::ready::ReadySignal;
use super::super::XdsState;

#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: Arc<str>,
    nonce: Arc<str>,
}

/// Builds the response for `type_url`, restricted to `resource_names` when
/// Envoy named specific resources (explicit-name ADS requests and every
/// non-initial request); an empty list means "send everything of this type",
/// the wildcard form of the first request for a type.
fn build_response(state: &XdsState, type_url: &str, resource_names: &[String]) -> DiscoveryResponse {
    let resources = state.cached_resources(type_url);
    let resources = if resource_names.is_empty() {
        resources
    } else {
        resources.into_iter().filter(|cached| resource_names.contains(&cached.name)).collect()
    };
    DiscoveryResponse {
        version_info: state.get_version(),
        resources: resources.into_iter().map(|cached| cached.body).collect(),
        type_url: type_url.to_string(),
        nonce: uuid::Uuid::new_v4().to_string(),
        ..Default::default()
    }
}

/// Run the SOTW ADS stream loop for one connected client. `fixed_type_url`
/// restricts it to a single resource type for the non-aggregated CDS/RDS/LDS
/// services; `None` serves whatever `type_url` each request names, for ADS.
pub fn run_stream_loop(
    state: Arc<XdsState>,
    ready: Arc<ReadySignal>,
    mut in_stream: tonic::Streaming<DiscoveryRequest>,
    fixed_type_url: Option<&'static str>,
    label: &'static str,
) -> ReceiverStream<std::result::Result<DiscoveryResponse, Status>> {
    let (tx, rx) = mpsc::channel(100);
    let state_clone = state.clone();
    let mut update_rx = state.subscribe_updates();
    let last_sent = Arc::new(Mutex::new(HashMap::<String, LastDiscoverySnapshot>::new()));
    let mut initial_subscription = std::collections::HashSet::<String>::new();
    if let Some(fixed) = fixed_type_url {
        initial_subscription.insert(fixed.to_string());
    }
    let subscribed = Arc::new(Mutex::new(initial_subscription));
    let requested_names = Arc::new(Mutex::new(HashMap::<String, Vec<String>>::new()));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = in_stream.next() => {
                    match result {
                        Some(Ok(request)) => {
                            ready.trip_with(request.node.as_ref().map(|node| node.id.clone()));

                            let type_url = fixed_type_url.map(str::to_string).unwrap_or_else(|| request.type_url.clone());
                            info!(type_url = %type_url, version_info = %request.version_info, stream = label, "received discovery request");

                            if let Some(error_detail) = request.error_detail.as_ref() {
                                warn!(type_url = %type_url, error_message = %error_detail.message, stream = label, "NACK: Envoy rejected previous response");
                            }

                            let is_ack = {
                                let tracker = last_sent.lock().await;
                                tracker.get(&type_url).is_some_and(|snapshot| {
                                    !request.response_nonce.is_empty()
                                        && request.response_nonce.as_str() == snapshot.nonce.as_ref()
                                        && request.version_info.as_str() == snapshot.version.as_ref()
                                        && request.error_detail.is_none()
                                        && snapshot.version.as_ref() == state_clone.get_version()
                                })
                            };
                            if is_ack {
                                debug!(type_url = %type_url, stream = label, "ACK, skipping duplicate response");
                                continue;
                            }

                            subscribed.lock().await.insert(type_url.clone());
                            requested_names.lock().await.insert(type_url.clone(), request.resource_names.clone());

                            let response = build_response(&state_clone, &type_url, &request.resource_names);
                            last_sent.lock().await.insert(
                                type_url.clone(),
                                LastDiscoverySnapshot {
                                    version: Arc::from(response.version_info.as_str()),
                                    nonce: Arc::from(response.nonce.as_str()),
                                },
                            );
                            if tx.send(Ok(response)).await.is_err() {
                                error!(stream = label, "discovery response receiver dropped");
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            warn!(stream = label, %error, "error receiving discovery request");
                            let _ = tx.send(Err(error)).await;
                            break;
                        }
                        None => {
                            info!(stream = label, "stream ended by client");
                            break;
                        }
                    }
                }
                update = update_rx.recv() => {
                    match update {
                        Ok(update) => {
                            let interested = subscribed.lock().await.clone();
                            for delta in &update.deltas {
                                if !interested.contains(&delta.type_url) {
                                    continue;
                                }
                                let names = requested_names.lock().await.get(&delta.type_url).cloned().unwrap_or_default();
                                let response = build_response(&state_clone, &delta.type_url, &names);
                                last_sent.lock().await.insert(
                                    delta.type_url.clone(),
                                    LastDiscoverySnapshot {
                                        version: Arc::from(response.version_info.as_str()),
                                        nonce: Arc::from(response.nonce.as_str()),
                                    },
                                );
                                info!(type_url = %delta.type_url, version = update.version, stream = label, "pushing snapshot update");
                                if tx.send(Ok(response)).await.is_err() {
                                    error!(stream = label, "discovery response receiver dropped");
                                    return;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(stream = label, skipped, "missed update notifications");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            warn!(stream = label, "update channel closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    ReceiverStream::new(rx)
}
