//! Shared xDS server state: per-type resource caches, version counter, and
//! the broadcast channel that fans snapshot changes out to every open stream.
//!
//! Grounded on the teacher's `xds/state.rs`, trimmed of the REST-API-facing
//! repository fields (cluster/route/listener/filter repositories, secret
//! backends, learning sessions) this control plane has no use for — resources
//! here come from the snapshot engine, not a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use envoy_types::pb::google::protobuf::Any;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::config::Settings;
use crate::snapshot::resources::BuiltResource;

/// Cached Envoy resource plus the version it was last changed at.
#[derive(Clone, Debug)]
pub struct CachedResource {
    pub name: String,
    pub type_url: String,
    pub version: u64,
    pub body: Any,
}

/// Delta information for a single type URL, used both for broadcast and for
/// building Delta-style responses if a caller wants them.
#[derive(Clone, Debug, Default)]
pub struct ResourceDelta {
    pub type_url: String,
    pub added_or_updated: Vec<CachedResource>,
    pub removed: Vec<String>,
}

/// Broadcast payload describing all resources changed in a single publish.
#[derive(Clone, Debug, Default)]
pub struct ResourceUpdate {
    pub version: u64,
    pub deltas: Vec<ResourceDelta>,
}

/// Shared xDS server state: the cached resource-by-type-by-name store, the
/// monotonic version counter, and the broadcast channel SOTW streams
/// subscribe to for push updates.
#[derive(Debug)]
pub struct XdsState {
    pub config: Settings,
    version: AtomicU64,
    update_tx: broadcast::Sender<std::sync::Arc<ResourceUpdate>>,
    resource_caches: RwLock<HashMap<String, HashMap<String, CachedResource>>>,
}

impl XdsState {
    pub fn new(config: Settings) -> Self {
        let (update_tx, _) = broadcast::channel(128);
        Self { config, version: AtomicU64::new(0), update_tx, resource_caches: RwLock::new(HashMap::new()) }
    }

    pub fn get_version(&self) -> String {
        self.version.load(Ordering::Acquire).to_string()
    }

    pub fn get_version_number(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Atomically advance the snapshot version. Called once per `sync()` pass
    /// by the snapshot engine (SPEC_FULL.md §4.B step 5), before the three
    /// per-type applies below — every type changed in that pass shares one
    /// version number even though they are diffed and broadcast independently.
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Diff `built_resources` against the cache for `type_url` and apply the
    /// change under the given (already-advanced) `version`. Returns `None`
    /// when nothing in this type changed, in which case no broadcast fires.
    #[instrument(skip(self, built_resources), fields(type_url = %type_url, resource_count = built_resources.len()))]
    pub fn apply_built_resources(
        &self,
        type_url: &str,
        version: u64,
        built_resources: Vec<BuiltResource>,
    ) -> Option<std::sync::Arc<ResourceUpdate>> {
        let mut caches = self.resource_caches.write().expect("resource cache lock poisoned");
        let cache = caches.entry(type_url.to_string()).or_default();

        let incoming_names: HashSet<String> =
            built_resources.iter().map(|resource| resource.name.clone()).collect();

        let removed: Vec<String> =
            cache.keys().filter(|name| !incoming_names.contains(*name)).cloned().collect();

        let mut pending: Vec<BuiltResource> = Vec::new();
        for built in built_resources {
            match cache.get(&built.name) {
                Some(existing) if existing.body == built.resource => {}
                _ => pending.push(built),
            }
        }

        if pending.is_empty() && removed.is_empty() {
            return None;
        }

        for name in &removed {
            cache.remove(name);
        }

        let mut delta = ResourceDelta { type_url: type_url.to_string(), ..Default::default() };
        for built in pending {
            let cached =
                CachedResource { name: built.name.clone(), type_url: type_url.to_string(), version, body: built.resource };
            cache.insert(built.name.clone(), cached.clone());
            delta.added_or_updated.push(cached);
        }
        delta.removed = removed;

        let update = std::sync::Arc::new(ResourceUpdate { version, deltas: vec![delta] });
        let _ = self.update_tx.send(update.clone());
        Some(update)
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<std::sync::Arc<ResourceUpdate>> {
        self.update_tx.subscribe()
    }

    /// Snapshot of the cached resources for one type URL, used to answer a
    /// fresh SOTW request (initial, ACK-miss, or push).
    pub fn cached_resources(&self, type_url: &str) -> Vec<CachedResource> {
        let caches = self.resource_caches.read().expect("resource cache lock poisoned");
        caches.get(type_url).map(|cache| cache.values().cloned().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::XdsState;
    use crate::config::Settings;
    use std::sync::Arc;

    pub fn empty_state() -> Arc<XdsState> {
        Arc::new(XdsState::new(Settings::default()))
    }
}
