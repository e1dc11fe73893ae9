//! App Mesh virtual-node reconciler: keeps the gateway's own `VirtualNode`
//! pointed at the current set of discovered virtual services as backends
//! (SPEC_FULL.md §4.F).
//!
//! Grounded on `pkg/discovery/virtualnode.go::Reconcile`: get-or-create, then
//! optimistic-concurrency retry-on-conflict on update, read through `kube`'s
//! dynamic API the same way [`super::appmesh`] reads `VirtualService`.

use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::info;

use crate::errors::{GatewayError, Result};

pub const GROUP: &str = "appmesh.k8s.aws";
pub const VERSION: &str = "v1beta1";
pub const KIND: &str = "VirtualNode";

const LISTENER_PORT: u32 = 444;
const LISTENER_PROTOCOL: &str = "http";
const MAX_CONFLICT_RETRIES: u32 = 5;

pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, KIND))
}

fn build_spec(mesh_name: &str, gateway_name: &str, gateway_namespace: &str, backends: &[String]) -> serde_json::Value {
    json!({
        "meshName": mesh_name,
        "listeners": [{
            "portMapping": { "port": LISTENER_PORT, "protocol": LISTENER_PROTOCOL },
        }],
        "serviceDiscovery": {
            "dns": { "hostName": format!("{gateway_name}.{gateway_namespace}") },
        },
        "backends": backends.iter().map(|name| json!({
            "virtualService": { "virtualServiceName": name },
        })).collect::<Vec<_>>(),
    })
}

/// Reconciles the gateway's `VirtualNode` so its `backends` list matches the
/// virtual services currently discovered and exposed.
pub struct VirtualNodeReconciler {
    api: Api<DynamicObject>,
    mesh_name: String,
    gateway_name: String,
    gateway_namespace: String,
}

impl VirtualNodeReconciler {
    pub fn new(client: Client, mesh_name: String, gateway_name: String, gateway_namespace: String) -> Self {
        let resource = api_resource();
        let api = Api::namespaced_with(client, &gateway_namespace, &resource);
        Self { api, mesh_name, gateway_name, gateway_namespace }
    }

    fn spec(&self, backends: &[String]) -> serde_json::Value {
        build_spec(&self.mesh_name, &self.gateway_name, &self.gateway_namespace, backends)
    }

    /// Lists virtual nodes in the gateway namespace once at startup, so a
    /// missing RBAC grant is caught before the reconcile loop ever runs
    /// instead of surfacing as a recurring background warning.
    pub async fn check_access(&self) -> Result<()> {
        self.api
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|error| GatewayError::kubernetes(error, "listing virtual nodes in gateway namespace (RBAC check)"))?;
        Ok(())
    }

    /// Get-or-create the virtual node, then update its `backends` with
    /// optimistic-concurrency retry on conflict, mirroring `retry.RetryOnConflict`.
    pub async fn reconcile(&self, backends: &[String]) -> Result<()> {
        let spec = self.spec(backends);

        match self.api.get(&self.gateway_name).await {
            Err(kube::Error::Api(response)) if response.code == 404 => {
                let object = DynamicObject::new(&self.gateway_name, &api_resource())
                    .within(&self.gateway_namespace)
                    .data(json!({ "spec": spec }));
                self.api
                    .create(&PostParams::default(), &object)
                    .await
                    .map_err(|error| GatewayError::kubernetes(error, "failed to create gateway virtual node"))?;
                info!(name = %self.gateway_name, "created gateway virtual node");
                Ok(())
            }
            Err(error) => Err(GatewayError::kubernetes(error, "failed to get gateway virtual node")),
            Ok(_) => self.update_with_retry(&spec).await,
        }
    }

    async fn update_with_retry(&self, spec: &serde_json::Value) -> Result<()> {
        let patch = Patch::Merge(json!({ "spec": spec }));
        let params = PatchParams::default();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.patch(&self.gateway_name, &params, &patch).await {
                Ok(_) => {
                    info!(name = %self.gateway_name, "updated gateway virtual node backends");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 409 && attempt < MAX_CONFLICT_RETRIES => {
                    continue;
                }
                Err(error) => {
                    return Err(GatewayError::reconcile(format!(
                        "failed to update gateway virtual node after {attempt} attempt(s): {error}"
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_reflects_backends_in_order() {
        let backends = vec!["vs-a".to_string(), "vs-b".to_string()];
        let spec = build_spec("gateway-mesh", "gateway", "default", &backends);

        assert_eq!(spec["meshName"], "gateway-mesh");
        assert_eq!(spec["serviceDiscovery"]["dns"]["hostName"], "gateway.default");
        assert_eq!(spec["listeners"][0]["portMapping"]["port"], LISTENER_PORT);
        assert_eq!(spec["listeners"][0]["portMapping"]["protocol"], LISTENER_PROTOCOL);
        assert_eq!(spec["backends"][0]["virtualService"]["virtualServiceName"], "vs-a");
        assert_eq!(spec["backends"][1]["virtualService"]["virtualServiceName"], "vs-b");
        assert_eq!(spec["backends"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn spec_with_no_backends_is_an_empty_list() {
        let spec = build_spec("gateway-mesh", "gateway", "default", &[]);
        assert!(spec["backends"].as_array().unwrap().is_empty());
    }
}
