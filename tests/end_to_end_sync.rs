//! End-to-end discovery-to-snapshot scenarios, exercised against in-memory
//! projector/engine calls with no live Kubernetes API server or Envoy.
//! Covers the literal scenarios in SPEC_FULL.md §8.

use std::sync::Arc;

use prost::Message;
use serde_json::json;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use k8s_openapi::api::core::v1::Service;

use xds_gateway::config::Settings;
use xds_gateway::discovery::kubernetes::ServiceProjector;
use xds_gateway::snapshot::resources::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL};
use xds_gateway::snapshot::SnapshotEngine;
use xds_gateway::xds::XdsState;

fn service(name: &str, namespace: &str, annotations: serde_json::Value) -> Service {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": namespace, "annotations": annotations },
        "spec": { "ports": [{ "name": "http", "port": 9898 }] },
    }))
    .unwrap()
}

fn engine() -> Arc<SnapshotEngine> {
    let state = Arc::new(XdsState::new(Settings::default()));
    let engine = Arc::new(SnapshotEngine::new(state));
    engine.set_node_id("envoy-test".to_string());
    engine
}

fn only_cluster(engine: &SnapshotEngine) -> Cluster {
    let resources = engine.cached_resources(CLUSTER_TYPE_URL);
    assert_eq!(resources.len(), 1);
    Cluster::decode(resources[0].value.as_slice()).unwrap()
}

fn route_config(engine: &SnapshotEngine) -> RouteConfiguration {
    let resources = engine.cached_resources(ROUTE_TYPE_URL);
    assert_eq!(resources.len(), 1);
    RouteConfiguration::decode(resources[0].value.as_slice()).unwrap()
}

fn listener(engine: &SnapshotEngine) -> Listener {
    let resources = engine.cached_resources(LISTENER_TYPE_URL);
    assert_eq!(resources.len(), 1);
    Listener::decode(resources[0].value.as_slice()).unwrap()
}

// Scenario 1: insert-then-query.
#[test]
fn insert_then_query_produces_one_cluster_and_matching_listener() {
    let engine = engine();
    let projector = ServiceProjector::new("http".to_string(), "gateway.appmesh.k8s.aws".to_string(), false);

    let svc = service("app0", "test", json!({}));
    engine.store("test/app0".to_string(), projector.to_upstream(&svc));
    engine.sync().unwrap();

    let cluster = only_cluster(&engine);
    assert_eq!(cluster.name, "app0-test-9898");

    let route_config = route_config(&engine);
    assert_eq!(route_config.virtual_hosts.len(), 1);
    assert!(route_config.virtual_hosts[0].domains.contains(&"app0.test.svc.cluster.local".to_string()));

    let listener = listener(&engine);
    assert_eq!(listener.name, "listener_http");
}

// Scenario 2: annotation exclusion removes the cluster, version/checksum change.
#[test]
fn expose_false_annotation_removes_cluster_on_next_sync() {
    let engine = engine();
    let projector = ServiceProjector::new("http".to_string(), "gateway.appmesh.k8s.aws".to_string(), false);

    let svc = service("app0", "test", json!({}));
    engine.store("test/app0".to_string(), projector.to_upstream(&svc));
    engine.sync().unwrap();
    let version_with_cluster = engine.version();
    assert_eq!(engine.cached_resources(CLUSTER_TYPE_URL).len(), 1);

    // The controller's sync_one would call engine.delete() once the object
    // fails `is_valid`; model that directly since there is no live informer here.
    let excluded = service("app0", "test", json!({ "gateway.appmesh.k8s.aws/expose": "false" }));
    assert!(!projector.is_valid(&excluded));
    engine.delete(&"test/app0".to_string());
    engine.sync().unwrap();

    assert_eq!(engine.cached_resources(CLUSTER_TYPE_URL).len(), 0);
    assert!(engine.version() > version_with_cluster);
}

// Scenario 3: opt-in mode excludes until the annotation flips to "true".
#[test]
fn opt_in_mode_admits_only_once_expose_true_is_set() {
    use kube::api::DynamicObject;
    use xds_gateway::discovery::appmesh::{api_resource, VirtualServiceProjector};

    fn virtual_service(annotations: serde_json::Value) -> DynamicObject {
        let resource = api_resource();
        let mut object = DynamicObject::new("vs0", &resource);
        object.data = json!({ "spec": { "virtualRouter": { "listeners": [{ "portMapping": { "port": 9898 } }] } } });
        object.metadata.annotations = Some(
            annotations
                .as_object()
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.as_str().unwrap().to_string())).collect())
                .unwrap_or_default(),
        );
        object
    }

    let projector = VirtualServiceProjector::new("gateway.appmesh.k8s.aws".to_string(), true);

    // Opt-in without an explicit annotation does not itself reject (the
    // original implementation's quirk, preserved verbatim).
    assert!(projector.is_valid(&virtual_service(json!({}))));
    assert!(!projector.is_valid(&virtual_service(json!({ "gateway.appmesh.k8s.aws/expose": "false" }))));
    assert!(projector.is_valid(&virtual_service(json!({ "gateway.appmesh.k8s.aws/expose": "true" }))));
}

// Scenario 4: canary produces a weighted-cluster route, given both named
// clusters are separately registered (the documented canary trap behavior).
#[test]
fn canary_annotations_produce_a_weighted_route() {
    use envoy_types::pb::envoy::config::route::v3::{route::Action, route_action::ClusterSpecifier};

    let engine = engine();
    let projector = ServiceProjector::new("http".to_string(), "gateway.appmesh.k8s.aws".to_string(), false);

    let svc = service(
        "app0",
        "test",
        json!({
            "gateway.appmesh.k8s.aws/primary": "app0-primary",
            "gateway.appmesh.k8s.aws/canary": "app0-canary",
            "gateway.appmesh.k8s.aws/canary-weight": "30",
        }),
    );
    engine.store("test/app0".to_string(), projector.to_upstream(&svc));
    engine.store("test/app0-primary".to_string(), projector.to_upstream(&service("app0-primary", "test", json!({}))));
    engine.store("test/app0-canary".to_string(), projector.to_upstream(&service("app0-canary", "test", json!({}))));
    engine.sync().unwrap();

    let route_config = route_config(&engine);
    let virtual_host = route_config.virtual_hosts.iter().find(|vh| vh.name == "app0-test-9898").unwrap();
    let action = virtual_host.routes[0].action.as_ref().unwrap();
    let Action::Route(route_action) = action else { panic!("expected a route action") };
    let Some(ClusterSpecifier::WeightedClusters(weighted)) = &route_action.cluster_specifier else {
        panic!("expected a weighted-cluster specifier")
    };

    let by_name: std::collections::HashMap<_, _> =
        weighted.clusters.iter().map(|c| (c.name.as_str(), c.weight.as_ref().unwrap().value)).collect();
    assert_eq!(by_name["app0-canary"], 30);
    assert_eq!(by_name["app0-primary"], 70);
}

// Scenario 5: idempotent sync.
#[test]
fn two_identical_syncs_publish_once() {
    let engine = engine();
    let projector = ServiceProjector::new("http".to_string(), "gateway.appmesh.k8s.aws".to_string(), false);

    engine.store("test/app0".to_string(), projector.to_upstream(&service("app0", "test", json!({}))));
    engine.sync().unwrap();
    let version = engine.version();

    engine.sync().unwrap();
    assert_eq!(engine.version(), version);
}

// Dedup invariant: domains in an emitted VirtualHost contain no duplicates,
// even when an operator's `domain` annotation repeats a canonical one.
#[test]
fn virtual_host_domains_have_no_duplicates_after_annotation_overlap() {
    let engine = engine();
    let projector = ServiceProjector::new("http".to_string(), "gateway.appmesh.k8s.aws".to_string(), false);

    let svc = service("app0", "test", json!({ "gateway.appmesh.k8s.aws/domain": "app0.test" }));
    engine.store("test/app0".to_string(), projector.to_upstream(&svc));
    engine.sync().unwrap();

    let route_config = route_config(&engine);
    let domains = &route_config.virtual_hosts[0].domains;
    let unique: std::collections::HashSet<_> = domains.iter().collect();
    assert_eq!(unique.len(), domains.len());
}
