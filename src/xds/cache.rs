//! Versioned snapshot cache of translated resources.
//!
//! Each resource type holds an immutable generation behind an `Arc`; updates
//! build a new generation and swap it in under the write lock, so readers
//! only ever see a complete generation. Versions come from one counter shared
//! by all types and double as response nonces.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::DiscoveryResponse;
use envoy_types::pb::google::protobuf::Any;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{BuiltResource, ResourceType};

const UPDATE_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Default)]
struct Generation {
    version: u64,
    resources: BTreeMap<String, Any>,
}

/// Published when a resource type gets a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub resource_type: ResourceType,
    pub version: u64,
}

#[derive(Debug)]
pub struct SnapshotCache {
    counter: AtomicU64,
    generations: RwLock<HashMap<ResourceType, Arc<Generation>>>,
    update_tx: broadcast::Sender<SnapshotUpdate>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { counter: AtomicU64::new(0), generations: RwLock::new(HashMap::new()), update_tx }
    }

    /// Replace the resources of `resource_type`.
    ///
    /// Returns the new version, or `None` when the set is unchanged. An empty
    /// set on a type that never had resources is also no change.
    pub fn update(&self, resource_type: ResourceType, resources: Vec<BuiltResource>) -> Option<u64> {
        let incoming: BTreeMap<String, Any> =
            resources.into_iter().map(|r| (r.name, r.resource)).collect();

        let mut generations = self.generations.write();
        match generations.get(&resource_type) {
            Some(current) if current.resources == incoming => return None,
            None if incoming.is_empty() => return None,
            _ => {}
        }

        let version = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let count = incoming.len();
        generations.insert(resource_type, Arc::new(Generation { version, resources: incoming }));
        drop(generations);

        debug!(%resource_type, version, resources = count, "Published new generation");
        let _ = self.update_tx.send(SnapshotUpdate { resource_type, version });
        Some(version)
    }

    fn generation(&self, resource_type: ResourceType) -> Option<Arc<Generation>> {
        self.generations.read().get(&resource_type).cloned()
    }

    /// Current version of `resource_type`, `"0"` before the first update.
    pub fn version(&self, resource_type: ResourceType) -> String {
        self.generation(resource_type).map(|g| g.version).unwrap_or_default().to_string()
    }

    /// Names of the current resources of `resource_type`, sorted.
    pub fn resource_names(&self, resource_type: ResourceType) -> Vec<String> {
        self.generation(resource_type)
            .map(|g| g.resources.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Answer a discovery request. No names means every resource; unknown
    /// names are skipped.
    pub fn query(&self, resource_type: ResourceType, names: &[String]) -> DiscoveryResponse {
        let generation = self.generation(resource_type).unwrap_or_default();
        let resources = if names.is_empty() {
            generation.resources.values().cloned().collect()
        } else {
            generation
                .resources
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(_, resource)| resource.clone())
                .collect()
        };
        let version = generation.version.to_string();
        DiscoveryResponse {
            version_info: version.clone(),
            resources,
            type_url: resource_type.type_url().to_string(),
            nonce: version,
            ..Default::default()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.update_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::CLUSTER_TYPE_URL;

    fn resource(name: &str, payload: &[u8]) -> BuiltResource {
        BuiltResource {
            name: name.to_string(),
            resource: Any { type_url: CLUSTER_TYPE_URL.to_string(), value: payload.to_vec() },
        }
    }

    #[test]
    fn unchanged_sets_keep_their_version() {
        let cache = SnapshotCache::new();
        assert_eq!(cache.update(ResourceType::Cluster, Vec::new()), None);
        assert_eq!(cache.version(ResourceType::Cluster), "0");

        assert_eq!(cache.update(ResourceType::Cluster, vec![resource("a", b"1")]), Some(1));
        assert_eq!(cache.update(ResourceType::Cluster, vec![resource("a", b"1")]), None);
        assert_eq!(cache.version(ResourceType::Cluster), "1");

        assert_eq!(cache.update(ResourceType::Cluster, vec![resource("a", b"2")]), Some(2));
        assert_eq!(cache.update(ResourceType::Cluster, Vec::new()), Some(3));
        assert!(cache.resource_names(ResourceType::Cluster).is_empty());
    }

    #[test]
    fn versions_are_shared_across_types() {
        let cache = SnapshotCache::new();
        cache.update(ResourceType::Cluster, vec![resource("a", b"1")]);
        cache.update(ResourceType::Listener, vec![resource("l", b"1")]);
        assert_eq!(cache.version(ResourceType::Cluster), "1");
        assert_eq!(cache.version(ResourceType::Listener), "2");
        assert_eq!(cache.version(ResourceType::Route), "0");
    }

    #[test]
    fn query_filters_and_sorts_by_name() {
        let cache = SnapshotCache::new();
        cache.update(
            ResourceType::Cluster,
            vec![resource("c", b"3"), resource("a", b"1"), resource("b", b"2")],
        );
        let all = cache.query(ResourceType::Cluster, &[]);
        assert_eq!(all.version_info, "1");
        assert_eq!(all.nonce, "1");
        assert_eq!(all.type_url, CLUSTER_TYPE_URL);
        let payloads: Vec<&[u8]> = all.resources.iter().map(|r| r.value.as_slice()).collect();
        assert_eq!(payloads, vec![b"1".as_slice(), b"2", b"3"]);

        let some = cache.query(ResourceType::Cluster, &["c".into(), "missing".into()]);
        assert_eq!(some.resources.len(), 1);
        assert_eq!(some.resources[0].value, b"3");

        let none = cache.query(ResourceType::Secret, &[]);
        assert_eq!(none.version_info, "0");
        assert!(none.resources.is_empty());
    }

    #[tokio::test]
    async fn updates_are_broadcast() {
        let cache = SnapshotCache::new();
        let mut rx = cache.subscribe();
        cache.update(ResourceType::Route, vec![resource("ingress_http", b"1")]);
        cache.update(ResourceType::Route, vec![resource("ingress_http", b"1")]);
        cache.update(ResourceType::Route, vec![resource("ingress_http", b"2")]);
        assert_eq!(
            rx.recv().await.unwrap(),
            SnapshotUpdate { resource_type: ResourceType::Route, version: 1 }
        );
        assert_eq!(rx.recv().await.unwrap().version, 2);
        assert!(rx.try_recv().is_err());
    }
}
