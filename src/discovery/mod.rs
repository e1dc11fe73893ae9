//! Discovery controllers: Kubernetes `Service` and App Mesh `VirtualService`
//! source projectors, the shared work queue they run on, and the App Mesh
//! virtual-node reconciler (SPEC_FULL.md §4.D–§4.F).

pub mod appmesh;
pub mod kubernetes;
pub mod queue;
pub mod virtualnode;

use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::errors::{GatewayError, Result};
use crate::snapshot::SnapshotEngine;

/// Build a Kubernetes client from `--master`/`--kubeconfig`, falling back to
/// in-cluster config when both are empty (SPEC_FULL.md §4.G).
pub async fn build_client(master: &str, kubeconfig: &str) -> Result<Client> {
    if master.is_empty() && kubeconfig.is_empty() {
        return Client::try_default().await.map_err(|error| GatewayError::kubernetes(error, "building in-cluster client"));
    }

    let mut options = KubeConfigOptions::default();
    if !master.is_empty() {
        options.cluster = Some(master.to_string());
    }

    let config = if kubeconfig.is_empty() {
        Kubeconfig::read().map_err(|error| GatewayError::config(format!("failed to read default kubeconfig: {error}")))?
    } else {
        Kubeconfig::read_from(kubeconfig)
            .map_err(|error| GatewayError::config(format!("failed to read kubeconfig {kubeconfig}: {error}")))?
    };

    let client_config = kube::Config::from_custom_kubeconfig(config, &options)
        .await
        .map_err(|error| GatewayError::config(format!("failed to build client config: {error}")))?;

    Client::try_from(client_config).map_err(|error| GatewayError::kubernetes(error, "building client from kubeconfig"))
}

/// Run Kubernetes Service discovery until cancelled.
pub async fn run_kubernetes(
    client: Client,
    namespace: Option<String>,
    engine: Arc<SnapshotEngine>,
    port_name: String,
    annotation_prefix: String,
    opt_in: bool,
    workers: usize,
) -> Result<()> {
    info!(port_name = %port_name, opt_in, "starting Kubernetes discovery workers");
    kubernetes::KubernetesDiscovery::new(client, namespace, engine, port_name, annotation_prefix, opt_in).run(workers).await
}

/// Run App Mesh VirtualService discovery, reconciling the gateway's virtual
/// node's backend list on the same cadence as the periodic resync.
pub async fn run_appmesh(
    client: Client,
    namespace: Option<String>,
    engine: Arc<SnapshotEngine>,
    annotation_prefix: String,
    opt_in: bool,
    gateway_mesh: String,
    gateway_name: String,
    gateway_namespace: String,
    workers: usize,
) -> Result<()> {
    info!(opt_in, "starting App Mesh discovery workers");
    let discovery = appmesh::AppMeshDiscovery::new(client.clone(), namespace, engine, annotation_prefix, opt_in);
    let reconciler = virtualnode::VirtualNodeReconciler::new(client, gateway_mesh, gateway_name, gateway_namespace);
    reconciler.check_access().await?;
    let (backend_store, backend_projector) = discovery.backend_source();

    let reconcile_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let backends = backend_store.state().iter().filter(|object| backend_projector.is_valid(object)).map(|o| o.name_any()).collect::<Vec<_>>();
            if let Err(error) = reconciler.reconcile(&backends).await {
                tracing::warn!(%error, "virtual node reconcile failed");
            }
        }
    });

    let result = discovery.run(workers).await;
    reconcile_handle.abort();
    result
}
