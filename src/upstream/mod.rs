//! The canonical, source-agnostic routing record (SPEC_FULL.md §3, §4.A).
//!
//! Grounded on `pkg/envoy/upstream.go` in the original Go implementation, which
//! defines the same flat `Upstream`/`Canary` pair this module models.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub const DEFAULT_KUBERNETES_RETRIES: u32 = 2;
pub const DEFAULT_KUBERNETES_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_APPMESH_RETRIES: u32 = 2;
pub const DEFAULT_APPMESH_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_PREFIX: &str = "/";

/// One routable backend: the thing the snapshot engine turns into an Envoy
/// cluster + virtual host pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Upstream {
    pub name: String,
    pub host: String,
    pub port: u32,
    pub port_name: String,
    /// Ordered, deduplicated virtual-host match domains.
    pub domains: Vec<String>,
    pub prefix: String,
    pub retries: u32,
    pub timeout: Duration,
    pub canary: Option<Canary>,
}

/// Weighted primary/canary cluster split (Kubernetes projector only).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Canary {
    pub primary_cluster: String,
    pub canary_cluster: String,
    pub canary_weight: u32,
}

impl Canary {
    /// A canary record only participates in routing when both cluster names
    /// are present; see SPEC_FULL.md §4.D and the Go `CanaryFromAnnotations` helper.
    pub fn is_active(&self) -> bool {
        !self.primary_cluster.is_empty() && !self.canary_cluster.is_empty()
    }

    /// `canaryWeight` is interpreted modulo 100; the primary receives the remainder.
    pub fn weights(&self) -> (u32, u32) {
        let canary_weight = self.canary_weight % 100;
        (canary_weight, 100 - canary_weight)
    }
}

impl Upstream {
    /// Append a domain if not already present, preserving insertion order
    /// (SPEC_FULL.md §8 "dedup" invariant).
    pub fn add_domain<S: Into<String>>(&mut self, domain: S) {
        let domain = domain.into();
        if !self.domains.contains(&domain) {
            self.domains.push(domain);
        }
    }
}

/// The upstream table keyed by `<namespace>/<name>` (SPEC_FULL.md §3).
pub type SourceKey = String;

pub fn source_key(namespace: &str, name: &str) -> SourceKey {
    format!("{}/{}", namespace, name)
}

/// Domain-stable 64-bit hash over the complete, sorted-by-key table contents.
/// Used solely for change detection in the snapshot engine (§4.A); not a
/// cryptographic checksum and not required to be stable across process
/// versions, only across process restarts given identical table contents.
pub fn table_checksum(table: &std::collections::BTreeMap<SourceKey, Upstream>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (key, upstream) in table {
        key.hash(&mut hasher);
        // `Duration` and `Vec<String>` both hash deterministically regardless
        // of how the table itself is stored (a `DashMap` has no stable
        // iteration order), which is why we require a `BTreeMap` snapshot here.
        upstream.name.hash(&mut hasher);
        upstream.host.hash(&mut hasher);
        upstream.port.hash(&mut hasher);
        upstream.port_name.hash(&mut hasher);
        upstream.domains.hash(&mut hasher);
        upstream.prefix.hash(&mut hasher);
        upstream.retries.hash(&mut hasher);
        upstream.timeout.hash(&mut hasher);
        if let Some(canary) = &upstream.canary {
            canary.primary_cluster.hash(&mut hasher);
            canary.canary_cluster.hash(&mut hasher);
            canary.canary_weight.hash(&mut hasher);
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn sample(name: &str) -> Upstream {
        Upstream {
            name: name.to_string(),
            host: "app0.test".to_string(),
            port: 9898,
            port_name: "http".to_string(),
            domains: vec!["app0.test".to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            retries: DEFAULT_KUBERNETES_RETRIES,
            timeout: DEFAULT_KUBERNETES_TIMEOUT,
            canary: None,
        }
    }

    #[test]
    fn add_domain_dedupes() {
        let mut upstream = sample("app0-test-9898");
        upstream.add_domain("app0.test");
        upstream.add_domain("app0.test:9898");
        assert_eq!(upstream.domains, vec!["app0.test", "app0.test:9898"]);
    }

    #[test]
    fn canary_weight_wraps_modulo_100() {
        let canary = Canary {
            primary_cluster: "p".to_string(),
            canary_cluster: "c".to_string(),
            canary_weight: 130,
        };
        assert_eq!(canary.weights(), (30, 70));
    }

    #[test]
    fn canary_inactive_without_both_clusters() {
        let canary = Canary {
            primary_cluster: String::new(),
            canary_cluster: "c".to_string(),
            canary_weight: 10,
        };
        assert!(!canary.is_active());
    }

    #[test]
    fn checksum_is_order_independent_over_table_contents() {
        let mut a = BTreeMap::new();
        a.insert(source_key("test", "app0"), sample("app0-test-9898"));
        let mut b = a.clone();
        assert_eq!(table_checksum(&a), table_checksum(&b));

        b.get_mut(&source_key("test", "app0")).unwrap().retries = 9;
        assert_ne!(table_checksum(&a), table_checksum(&b));
    }

    #[test]
    fn source_key_shape() {
        assert_eq!(source_key("test", "app0"), "test/app0");
    }

    proptest! {
        #[test]
        fn canary_weights_always_sum_to_100(weight in 0u32..=u32::MAX) {
            let canary = Canary { primary_cluster: "p".to_string(), canary_cluster: "c".to_string(), canary_weight: weight };
            let (canary_weight, primary_weight) = canary.weights();
            prop_assert_eq!(canary_weight + primary_weight, 100);
            prop_assert!(canary_weight < 100);
        }
    }
}
