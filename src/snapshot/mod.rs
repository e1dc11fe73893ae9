//! The snapshot engine (SPEC_FULL.md §4.B): reconciles the upstream table
//! into a checksum-gated Envoy snapshot and publishes it through [`crate::xds::XdsState`].
//!
//! Grounded on the diff/version/broadcast pipeline in the teacher's
//! `xds/state.rs::apply_built_resources`, generalized to build resources from
//! the upstream table instead of a database-backed repository.

pub mod resources;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::errors::{GatewayError, Result};
use crate::upstream::{table_checksum, SourceKey, Upstream};
use crate::xds::XdsState;

use resources::{
    build_cluster, build_listener, build_route_configuration, check_consistency, BuiltResource,
    CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
};

/// The live upstream table plus the machinery to reconcile it into an Envoy
/// snapshot. One instance is shared between the discovery controller(s) and
/// the xDS server's ready-signal callback.
pub struct SnapshotEngine {
    table: DashMap<SourceKey, Upstream>,
    node_id: RwLock<Option<String>>,
    last_checksum: AtomicU64,
    state: std::sync::Arc<XdsState>,
}

impl SnapshotEngine {
    pub fn new(state: std::sync::Arc<XdsState>) -> Self {
        Self {
            table: DashMap::new(),
            node_id: RwLock::new(None),
            last_checksum: AtomicU64::new(0),
            state,
        }
    }

    /// Insert or replace an entry in the table (§4.B `store`).
    pub fn store(&self, key: SourceKey, upstream: Upstream) {
        self.table.insert(key, upstream);
    }

    /// Remove an entry from the table (§4.B `delete`). Absent-key deletes are
    /// a no-op: the discovery controller's delete path does not distinguish
    /// "already gone" from "never existed".
    pub fn delete(&self, key: &SourceKey) {
        self.table.remove(key);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The snapshot version last published through `sync()`, for callers that
    /// want to observe idempotence/monotonicity without reaching into `XdsState`.
    pub fn version(&self) -> u64 {
        self.state.get_version_number()
    }

    /// The currently cached resource bodies for one xDS type URL, decodable
    /// with the matching `prost` message type.
    pub fn cached_resources(&self, type_url: &str) -> Vec<envoy_types::pb::google::protobuf::Any> {
        self.state.cached_resources(type_url).into_iter().map(|cached| cached.body).collect()
    }

    /// Record the node id of the first Envoy to connect. Called once from the
    /// xDS server's ready-signal callback (§4.C); a no-op on later calls, since
    /// this control plane targets a single connected Envoy node (§9).
    pub fn set_node_id(&self, node_id: String) {
        let mut guard = self.node_id.write().expect("node id lock poisoned");
        if guard.is_none() {
            info!(node_id = %node_id, "learned Envoy node id");
            *guard = Some(node_id);
        }
    }

    fn node_id(&self) -> Option<String> {
        self.node_id.read().expect("node id lock poisoned").clone()
    }

    /// Reconcile the table to an Envoy snapshot (§4.B `sync`). Returns `Ok(())`
    /// both when a new snapshot was published and when the checksum showed no
    /// change — callers only need to know whether the table is misconfigured.
    pub fn sync(&self) -> Result<()> {
        let node_id = self.node_id().ok_or_else(|| GatewayError::xds("NO_NODE"))?;

        let snapshot: BTreeMap<SourceKey, Upstream> =
            self.table.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();

        let checksum = table_checksum(&snapshot);
        if checksum == self.last_checksum.load(Ordering::Acquire) {
            debug!(checksum, "table unchanged, skipping snapshot publication");
            return Ok(());
        }

        let clusters: Vec<BuiltResource> = snapshot.values().map(build_cluster).collect();
        let route_resource = build_route_configuration(&snapshot);
        let listener_resource = build_listener();

        // Step 5: internal consistency before publication. We intentionally do
        // not synthesize clusters for a canary pair that only exists in one
        // upstream's route action — an operator who wants a canary split must
        // have separately-named Upstream entries for both clusters already in
        // the table, the same way any other upstream's cluster is populated.
        // If they are missing, this check fails and the previous snapshot
        // (already published) stays in effect rather than Envoy being handed
        // a route pointing at a cluster that doesn't exist.
        self.validate_consistency(&clusters, &route_resource)?;

        let version = self.state.next_version();
        info!(version, clusters = clusters.len(), "publishing new Envoy snapshot");

        self.state.apply_built_resources(CLUSTER_TYPE_URL, version, clusters);
        self.state.apply_built_resources(ROUTE_TYPE_URL, version, vec![route_resource]);
        self.state.apply_built_resources(LISTENER_TYPE_URL, version, vec![listener_resource]);

        self.last_checksum.store(checksum, Ordering::Release);
        debug!(node_id, "snapshot published for node");
        Ok(())
    }

    fn validate_consistency(&self, clusters: &[BuiltResource], route_resource: &BuiltResource) -> Result<()> {
        let route_config = decode_route_configuration(route_resource)?;
        if let Err(error) = check_consistency(clusters, &route_config) {
            warn!(error = %error, "snapshot rejected: inconsistent routes/clusters");
            return Err(error);
        }
        Ok(())
    }
}

fn decode_route_configuration(
    built: &BuiltResource,
) -> Result<envoy_types::pb::envoy::config::route::v3::RouteConfiguration> {
    use prost::Message;
    envoy_types::pb::envoy::config::route::v3::RouteConfiguration::decode(built.resource.value.as_slice())
        .map_err(|error| GatewayError::internal(format!("failed to decode built route configuration: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{Canary, DEFAULT_KUBERNETES_RETRIES, DEFAULT_KUBERNETES_TIMEOUT, DEFAULT_PREFIX};
    use crate::xds::state::test_support::empty_state;

    fn sample(name: &str, port: u32) -> Upstream {
        Upstream {
            name: name.to_string(),
            host: format!("{name}.test"),
            port,
            port_name: "http".to_string(),
            domains: vec![format!("{name}.test")],
            prefix: DEFAULT_PREFIX.to_string(),
            retries: DEFAULT_KUBERNETES_RETRIES,
            timeout: DEFAULT_KUBERNETES_TIMEOUT,
            canary: None,
        }
    }

    #[test]
    fn sync_without_node_fails_no_node() {
        let engine = SnapshotEngine::new(empty_state());
        engine.store("test/app0".to_string(), sample("app0", 9898));
        let error = engine.sync().unwrap_err();
        assert!(matches!(error, GatewayError::Xds { .. }));
        assert!(error.is_retryable());
    }

    #[test]
    fn sync_publishes_and_is_idempotent_on_unchanged_table() {
        let engine = SnapshotEngine::new(empty_state());
        engine.set_node_id("envoy-test".to_string());
        engine.store("test/app0".to_string(), sample("app0", 9898));

        engine.sync().unwrap();
        let version_after_first = engine.state.get_version_number();

        engine.sync().unwrap();
        assert_eq!(engine.state.get_version_number(), version_after_first, "no-op sync must not bump version");
    }

    #[test]
    fn sync_rejects_canary_referencing_absent_clusters() {
        let engine = SnapshotEngine::new(empty_state());
        engine.set_node_id("envoy-test".to_string());

        let mut upstream = sample("app0", 9898);
        upstream.canary = Some(Canary {
            primary_cluster: "app0-primary".to_string(),
            canary_cluster: "app0-canary".to_string(),
            canary_weight: 10,
        });
        engine.store("test/app0".to_string(), upstream);

        let error = engine.sync().unwrap_err();
        assert!(matches!(error, GatewayError::Xds { .. }));
    }

    #[test]
    fn sync_accepts_canary_when_both_clusters_are_separately_registered() {
        let engine = SnapshotEngine::new(empty_state());
        engine.set_node_id("envoy-test".to_string());

        let mut upstream = sample("app0", 9898);
        upstream.canary = Some(Canary {
            primary_cluster: "app0-primary".to_string(),
            canary_cluster: "app0-canary".to_string(),
            canary_weight: 10,
        });
        engine.store("test/app0".to_string(), upstream);
        engine.store("test/app0-primary".to_string(), sample("app0-primary", 9898));
        engine.store("test/app0-canary".to_string(), sample("app0-canary", 9899));

        engine.sync().unwrap();
    }

    #[test]
    fn delete_of_absent_key_is_a_no_op() {
        let engine = SnapshotEngine::new(empty_state());
        engine.delete(&"missing/key".to_string());
        assert_eq!(engine.len(), 0);
    }
}
