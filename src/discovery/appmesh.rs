//! AWS App Mesh `VirtualService` discovery: projector plus the
//! dynamic-client-backed controller (SPEC_FULL.md §4.D, §4.E).
//!
//! Grounded on `pkg/discovery/virtualservice.go::ConvertToUpstream`/`IsValid`
//! in the original implementation. App Mesh has no CRD Rust types in this
//! workspace, so `VirtualService` objects are read through `kube`'s
//! `DynamicObject` the way the Go code reads them through
//! `dynamic.Interface` + `unstructured.Unstructured`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::{reflector, watcher};
use kube::{Api, Client, ResourceExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

use crate::errors::{GatewayError, Result};
use crate::snapshot::SnapshotEngine;
use crate::upstream::{source_key, Upstream, DEFAULT_APPMESH_RETRIES, DEFAULT_APPMESH_TIMEOUT, DEFAULT_PREFIX};

use super::queue::WorkQueue;

pub const GROUP: &str = "appmesh.k8s.aws";
pub const VERSION: &str = "v1beta1";
pub const KIND: &str = "VirtualService";

const EXPOSE_ANNOTATION_SUFFIX: &str = "expose";
const DOMAIN_ANNOTATION_SUFFIX: &str = "domain";
const TIMEOUT_ANNOTATION_SUFFIX: &str = "timeout";
const RETRIES_ANNOTATION_SUFFIX: &str = "retries";

const RESYNC_PERIOD: Duration = Duration::from_secs(300);

pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, KIND))
}

/// Projects App Mesh `VirtualService` objects onto the internal upstream model.
#[derive(Clone)]
pub struct VirtualServiceProjector {
    annotation_prefix: String,
    opt_in: bool,
}

impl VirtualServiceProjector {
    pub fn new(annotation_prefix: String, opt_in: bool) -> Self {
        Self { annotation_prefix, opt_in }
    }

    fn annotation(&self, suffix: &str) -> String {
        format!("{}/{}", self.annotation_prefix, suffix)
    }

    /// Presence/port of the first listener, used only by `is_valid`'s
    /// fast-reject check (mirrors the original `IsValid`, which looks only
    /// at `listeners[0]`).
    fn first_listener_port(object: &DynamicObject) -> Option<u32> {
        object
            .data
            .pointer("/spec/virtualRouter/listeners/0/portMapping/port")
            .and_then(|port| port.as_u64())
            .map(|port| port as u32)
    }

    /// Port of the last listener, used by `to_upstream`: the original's
    /// conversion loop walks every listener and keeps whichever port it saw
    /// last, so a virtual router with more than one listener ends up routed
    /// on the last one's port, not the first.
    fn last_listener_port(object: &DynamicObject) -> Option<u32> {
        object
            .data
            .pointer("/spec/virtualRouter/listeners")
            .and_then(|listeners| listeners.as_array())
            .and_then(|listeners| listeners.last())
            .and_then(|listener| listener.pointer("/portMapping/port"))
            .and_then(|port| port.as_u64())
            .map(|port| port as u32)
    }

    /// Eligible when the virtual router declares a listener port. `opt_in`
    /// requires an explicit `expose: "true"` annotation to admit the
    /// service; otherwise only an explicit `expose: "false"` excludes it.
    /// Mirrors `VirtualServiceManager.IsValid` verbatim, including that a
    /// missing `expose` annotation under opt-in does not itself reject.
    pub fn is_valid(&self, object: &DynamicObject) -> bool {
        if Self::first_listener_port(object).is_none_or(|port| port == 0) {
            return false;
        }

        let expose = self.annotation(EXPOSE_ANNOTATION_SUFFIX);
        for (key, value) in object.annotations() {
            if self.opt_in && *key == expose && value != "true" {
                return false;
            }
            if *key == expose && value == "false" {
                return false;
            }
        }
        true
    }

    /// Two-domain set (`name`, `name:port`) plus domain/timeout/retries
    /// annotation overrides. App Mesh virtual services never carry a canary
    /// split (SPEC_FULL.md §4.D).
    pub fn to_upstream(&self, object: &DynamicObject) -> Upstream {
        let name = object.name_any();
        let port = Self::last_listener_port(object).unwrap_or(80);

        let mut upstream = Upstream {
            name: format!("{name}-{port}"),
            host: name.clone(),
            port,
            port_name: String::new(),
            domains: vec![name.clone(), format!("{name}:{port}")],
            prefix: DEFAULT_PREFIX.to_string(),
            retries: DEFAULT_APPMESH_RETRIES,
            timeout: DEFAULT_APPMESH_TIMEOUT,
            canary: None,
        };

        for (key, value) in object.annotations() {
            if *key == self.annotation(DOMAIN_ANNOTATION_SUFFIX) {
                upstream.add_domain(value.clone());
            } else if *key == self.annotation(TIMEOUT_ANNOTATION_SUFFIX) {
                if let Ok(duration) = humantime::parse_duration(value) {
                    upstream.timeout = duration;
                }
            } else if *key == self.annotation(RETRIES_ANNOTATION_SUFFIX) {
                if let Ok(retries) = value.parse() {
                    upstream.retries = retries;
                }
            }
        }

        upstream
    }
}

/// Watches App Mesh `VirtualService` objects and keeps the snapshot engine's
/// table current, the same shape as [`super::kubernetes::KubernetesDiscovery`].
pub struct AppMeshDiscovery {
    projector: VirtualServiceProjector,
    engine: Arc<SnapshotEngine>,
    store: reflector::Store<DynamicObject>,
    watch_events: std::pin::Pin<Box<dyn futures::Stream<Item = watcher::Result<watcher::Event<DynamicObject>>> + Send>>,
}

impl AppMeshDiscovery {
    pub fn new(client: Client, namespace: Option<String>, engine: Arc<SnapshotEngine>, annotation_prefix: String, opt_in: bool) -> Self {
        let resource = api_resource();
        let api: Api<DynamicObject> = match &namespace {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };
        let (store, writer) = reflector::store();
        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));

        Self {
            projector: VirtualServiceProjector::new(annotation_prefix, opt_in),
            engine,
            store,
            watch_events: Box::pin(stream),
        }
    }

    /// Names of every currently-valid virtual service, used by the virtual
    /// node reconciler to populate `backends` (SPEC_FULL.md §4.F).
    pub fn backend_names(&self) -> Vec<String> {
        backend_names(&self.store, &self.projector)
    }

    /// A cheap, independently-owned handle (the reflector store is
    /// internally `Arc`-backed) a caller can poll for `backend_names()`
    /// without holding on to the whole controller.
    pub fn backend_source(&self) -> (reflector::Store<DynamicObject>, VirtualServiceProjector) {
        (self.store.clone(), self.projector.clone())
    }

    pub async fn run(self, workers: usize) -> Result<()> {
        let AppMeshDiscovery { projector, engine, store, mut watch_events } = self;
        let (queue, rx) = WorkQueue::new();

        let resync_store = store.clone();
        let resync_engine = engine.clone();
        let resync_projector = projector.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RESYNC_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                sync_all(&resync_store, &resync_projector, &resync_engine);
            }
        });

        let event_queue = queue.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = watch_events.next().await {
                match event {
                    Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object)) => {
                        event_queue.add(source_key(&object.namespace().unwrap_or_default(), &object.name_any()));
                    }
                    Ok(watcher::Event::Delete(object)) => {
                        event_queue.add(source_key(&object.namespace().unwrap_or_default(), &object.name_any()));
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Err(error) => warn!(%error, "virtual service watch stream error"),
                }
            }
        });

        UnboundedReceiverStream::new(rx)
            .for_each_concurrent(workers, |key| {
                let engine = engine.clone();
                let store = store.clone();
                let projector = projector.clone();
                let queue = queue.clone();
                async move {
                    if let Err(error) = sync_one(&key, &engine, &store, &projector) {
                        queue.handle_err(key, &error);
                    } else {
                        queue.forget(&key);
                    }
                }
            })
            .await;

        let _ = event_task.await;
        Ok(())
    }
}

fn sync_one(
    key: &str,
    engine: &Arc<SnapshotEngine>,
    store: &reflector::Store<DynamicObject>,
    projector: &VirtualServiceProjector,
) -> Result<()> {
    let (namespace, name) = key
        .split_once('/')
        .map(|(ns, name)| (ns.to_string(), name.to_string()))
        .ok_or_else(|| GatewayError::internal(format!("malformed source key: {key}")))?;

    let found = store
        .state()
        .iter()
        .find(|object| object.namespace().as_deref() == Some(namespace.as_str()) && object.name_any() == name)
        .cloned();

    match found {
        None => {
            info!(key = %key, "deleting from upstream table");
            engine.delete(&key.to_string());
        }
        Some(object) => {
            if projector.is_valid(&object) {
                info!(key = %key, "storing in upstream table");
                engine.store(key.to_string(), projector.to_upstream(&object));
            } else {
                engine.delete(&key.to_string());
            }
        }
    }
    engine.sync()
}

fn backend_names(store: &reflector::Store<DynamicObject>, projector: &VirtualServiceProjector) -> Vec<String> {
    store.state().iter().filter(|object| projector.is_valid(object)).map(|object| object.name_any()).collect()
}

fn sync_all(store: &reflector::Store<DynamicObject>, projector: &VirtualServiceProjector, engine: &Arc<SnapshotEngine>) {
    let mut count = 0;
    for object in store.state().iter() {
        if projector.is_valid(object) {
            let key = source_key(&object.namespace().unwrap_or_default(), &object.name_any());
            engine.store(key, projector.to_upstream(object));
            count += 1;
        }
    }
    info!(count, "refreshed upstream table from full virtual service listing");
    if let Err(error) = engine.sync() {
        warn!(%error, "full resync sync() failed");
    }
}
