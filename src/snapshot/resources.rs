//! Builds Envoy v3 protobuf resources from [`crate::upstream::Upstream`] records.
//!
//! Grounded on `src/xds/resources.rs` and `src/xds/route.rs` in the teacher
//! (the `Any`-wrapping pattern and the `ClusterSpecifier`/`WeightedCluster`
//! shapes), generalized from a single hardcoded resource per type to one
//! resource per upstream.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::cluster::v3::{
    cluster::{ClusterDiscoveryType, DiscoveryType, DnsLookupFamily, LbPolicy},
    circuit_breakers::Thresholds,
    CircuitBreakers, Cluster,
};
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressKind, socket_address::PortSpecifier, Address, HeaderValue,
    HeaderValueOption, RoutingPriority, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::config::listener::v3::{Filter, FilterChain, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    retry_policy::RetryHostPredicate,
    route::Action,
    route_action::{ClusterSpecifier, HostRewriteSpecifier},
    route_match::PathSpecifier,
    weighted_cluster::ClusterWeight,
    Route, RouteAction, RouteConfiguration, RouteMatch, RetryPolicy, VirtualHost, WeightedCluster,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_filter::ConfigType as HttpFilterConfigType;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router as RouterFilter;
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

use crate::errors::{GatewayError, Result};
use crate::upstream::{SourceKey, Upstream};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

const LOCAL_ROUTE_NAME: &str = "local_route";
const LISTENER_NAME: &str = "listener_http";
const LISTENER_PORT: u32 = 8080;

/// A named Envoy resource ready to be cached and diffed by the xDS state store.
#[derive(Debug, Clone)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

fn any_of(type_url: &str, message: &impl Message) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

/// One cluster per upstream: `STRICT_DNS`, IPv4-only, least-request, with the
/// fixed circuit breaker and connect timeout SPEC_FULL.md §4.B requires.
pub fn build_cluster(upstream: &Upstream) -> BuiltResource {
    let cluster = Cluster {
        name: upstream.name.clone(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32)),
        dns_lookup_family: DnsLookupFamily::V4Only as i32,
        lb_policy: LbPolicy::LeastRequest as i32,
        connect_timeout: Some(Duration { seconds: 1, nanos: 0 }),
        circuit_breakers: Some(CircuitBreakers {
            thresholds: vec![Thresholds {
                priority: RoutingPriority::Default as i32,
                max_retries: Some(UInt32Value { value: 1024 }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: upstream.name.clone(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                        address: Some(Address {
                            address: Some(AddressKind::SocketAddress(SocketAddress {
                                address: upstream.host.clone(),
                                port_specifier: Some(PortSpecifier::PortValue(upstream.port)),
                                ..Default::default()
                            })),
                        }),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };

    BuiltResource { name: upstream.name.clone(), resource: any_of(CLUSTER_TYPE_URL, &cluster) }
}

fn retry_policy(upstream: &Upstream) -> RetryPolicy {
    RetryPolicy {
        retry_on: "connect-failure,refused-stream,unavailable,cancelled,resource-exhausted,retriable-status-codes"
            .to_string(),
        per_try_timeout: Some(duration_of(upstream.timeout)),
        num_retries: Some(UInt32Value { value: upstream.retries }),
        host_selection_retry_max_attempts: 5,
        retriable_status_codes: vec![503],
        retry_host_predicate: vec![RetryHostPredicate {
            name: "envoy.retry_host_predicates.previous_hosts".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn duration_of(timeout: std::time::Duration) -> Duration {
    Duration { seconds: timeout.as_secs() as i64, nanos: timeout.subsec_nanos() as i32 }
}

fn header_value_option(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue { key: key.to_string(), value: value.to_string(), ..Default::default() }),
        ..Default::default()
    }
}

/// One `VirtualHost` per upstream, per the construction rules in SPEC_FULL.md
/// §4.B: single-cluster or weighted-cluster action, fixed retry policy, and
/// the `l5d-*` header rewrite rules inherited from the linkerd-style original.
pub fn build_virtual_host(upstream: &Upstream) -> VirtualHost {
    let mut route_action = RouteAction {
        timeout: Some(duration_of(upstream.timeout)),
        host_rewrite_specifier: Some(HostRewriteSpecifier::HostRewriteLiteral(upstream.host.clone())),
        ..Default::default()
    };

    route_action.cluster_specifier = match &upstream.canary {
        Some(canary) if canary.is_active() => {
            let (canary_weight, primary_weight) = canary.weights();
            Some(ClusterSpecifier::WeightedClusters(WeightedCluster {
                clusters: vec![
                    ClusterWeight {
                        name: canary.primary_cluster.clone(),
                        weight: Some(UInt32Value { value: primary_weight }),
                        ..Default::default()
                    },
                    ClusterWeight {
                        name: canary.canary_cluster.clone(),
                        weight: Some(UInt32Value { value: canary_weight }),
                        ..Default::default()
                    },
                ],
                total_weight: Some(UInt32Value { value: 100 }),
                ..Default::default()
            }))
        }
        _ => Some(ClusterSpecifier::Cluster(upstream.name.clone())),
    };

    VirtualHost {
        name: upstream.name.clone(),
        domains: upstream.domains.clone(),
        retry_policy: Some(retry_policy(upstream)),
        routes: vec![Route {
            r#match: Some(RouteMatch {
                path_specifier: Some(PathSpecifier::Prefix(upstream.prefix.clone())),
                ..Default::default()
            }),
            action: Some(Action::Route(route_action)),
            request_headers_to_add: vec![header_value_option(
                "l5d-dst-override",
                &format!("{}.svc.cluster.local:{}", upstream.host, upstream.port),
            )],
            request_headers_to_remove: vec!["l5d-remote-ip".to_string(), "l5d-server-id".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Every referenced cluster name in a virtual host, including both names of a
/// weighted pair — used by the consistency check in `sync()` step 5.
pub fn referenced_cluster_names(virtual_host: &VirtualHost) -> Vec<String> {
    virtual_host
        .routes
        .iter()
        .filter_map(|route| route.action.as_ref())
        .flat_map(|action| match action {
            Action::Route(route_action) => match &route_action.cluster_specifier {
                Some(ClusterSpecifier::Cluster(name)) => vec![name.clone()],
                Some(ClusterSpecifier::WeightedClusters(weighted)) => {
                    weighted.clusters.iter().map(|c| c.name.clone()).collect()
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        })
        .collect()
}

/// The single `local_route` `RouteConfiguration` wrapping every upstream's
/// `VirtualHost`.
pub fn build_route_configuration(table: &BTreeMap<SourceKey, Upstream>) -> BuiltResource {
    let virtual_hosts = table.values().map(build_virtual_host).collect();
    let route_config = RouteConfiguration {
        name: LOCAL_ROUTE_NAME.to_string(),
        virtual_hosts,
        validate_clusters: Some(envoy_types::pb::google::protobuf::BoolValue { value: true }),
        ..Default::default()
    };
    BuiltResource {
        name: LOCAL_ROUTE_NAME.to_string(),
        resource: any_of(ROUTE_TYPE_URL, &route_config),
    }
}

/// The single `listener_http` listener: an HTTP connection manager delegating
/// routing to `local_route` over ADS, per SPEC_FULL.md §4.B.
pub fn build_listener() -> BuiltResource {
    use envoy_types::pb::envoy::config::core::v3::{
        config_source::ConfigSourceSpecifier, AggregatedConfigSource, ConfigSource,
    };
    use envoy_types::pb::envoy::config::listener::v3::filter::ConfigType as FilterConfigType;

    let router_filter = HttpFilter {
        name: "envoy.router".to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(any_of(
            "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router",
            &RouterFilter::default(),
        ))),
        ..Default::default()
    };

    let hcm = HttpConnectionManager {
        stat_prefix: "ingress_http".to_string(),
        route_specifier: Some(RouteSpecifier::Rds(
            envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::Rds {
                route_config_name: LOCAL_ROUTE_NAME.to_string(),
                config_source: Some(ConfigSource {
                    config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource::default())),
                    resource_api_version: 1,
                    ..Default::default()
                }),
            },
        )),
        use_remote_address: Some(envoy_types::pb::google::protobuf::BoolValue { value: true }),
        drain_timeout: Some(Duration { seconds: 5, nanos: 0 }),
        http_filters: vec![router_filter],
        ..Default::default()
    };

    let filter = Filter {
        name: "envoy.filters.network.http_connection_manager".to_string(),
        config_type: Some(FilterConfigType::TypedConfig(any_of(
            "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
            &hcm,
        ))),
    };

    let listener = Listener {
        name: LISTENER_NAME.to_string(),
        address: Some(Address {
            address: Some(AddressKind::SocketAddress(SocketAddress {
                address: "0.0.0.0".to_string(),
                port_specifier: Some(PortSpecifier::PortValue(LISTENER_PORT)),
                ..Default::default()
            })),
        }),
        filter_chains: vec![FilterChain { filters: vec![filter], ..Default::default() }],
        ..Default::default()
    };

    BuiltResource { name: LISTENER_NAME.to_string(), resource: any_of(LISTENER_TYPE_URL, &listener) }
}

/// Consistency check for `sync()` step 5: every cluster name a virtual host's
/// route(s) reference — including both names of a weighted pair — must exist
/// among the clusters this sync pass built. See `DESIGN.md` for why this, and
/// not auto-materializing the missing clusters, is the intended behavior.
pub fn check_consistency(clusters: &[BuiltResource], route_config: &RouteConfiguration) -> Result<()> {
    let cluster_names: std::collections::HashSet<&str> =
        clusters.iter().map(|c| c.name.as_str()).collect();

    for virtual_host in &route_config.virtual_hosts {
        for name in referenced_cluster_names(virtual_host) {
            if !cluster_names.contains(name.as_str()) {
                return Err(GatewayError::xds(format!(
                    "INCONSISTENT: virtual host '{}' references undefined cluster '{}'",
                    virtual_host.name, name
                )));
            }
        }
    }

    Ok(())
}
