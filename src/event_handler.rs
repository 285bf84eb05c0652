//! # Event handling
//!
//! Turns object events into published xDS snapshots: mutate the store, and
//! when the store says the change matters, rebuild the graph, translate it
//! and publish every resource type to the snapshot cache.
//!
//! Writers are serialized by one mutex held for the whole rebuild, so
//! generations are published in event order. Envoy-facing readers only touch
//! the snapshot cache and never wait on a rebuild.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::dag::{Builder, StatusUpdate};
use crate::k8s::{KubernetesObject, ObjectKey};
use crate::observability::MetricsRecorder;
use crate::store::{ResourceStore, StoreSettings};
use crate::xds::{translate, ResourceType, SnapshotCache, Translation};

struct State {
    store: ResourceStore,
    statuses: Vec<StatusUpdate>,
    translation: Translation,
}

pub struct EventHandler {
    builder: Builder,
    state: Mutex<State>,
    cache: Arc<SnapshotCache>,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler").field("builder", &self.builder).finish_non_exhaustive()
    }
}

impl EventHandler {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            ResourceStore::new(StoreSettings::from(config)),
            Builder::from_config(config),
            Arc::new(SnapshotCache::new()),
        )
    }

    /// Assemble a handler from explicit parts, e.g. a custom processor list.
    pub fn with_parts(store: ResourceStore, builder: Builder, cache: Arc<SnapshotCache>) -> Self {
        Self {
            builder,
            state: Mutex::new(State {
                store,
                statuses: Vec::new(),
                translation: Translation::default(),
            }),
            cache,
            metrics: MetricsRecorder::new(),
        }
    }

    /// Store a new object. Returns true when it caused a rebuild.
    pub fn on_add(&self, object: KubernetesObject) -> bool {
        let kind = object.kind();
        let mut state = self.state.lock();
        let dirty = state.store.insert(object);
        self.finish_event(&mut state, "add", kind.as_str(), dirty)
    }

    pub fn on_update(&self, old: KubernetesObject, new: KubernetesObject) -> bool {
        let kind = new.kind();
        let mut state = self.state.lock();
        let dirty = state.store.update(old, new);
        self.finish_event(&mut state, "update", kind.as_str(), dirty)
    }

    pub fn on_delete(&self, object: &KubernetesObject) -> bool {
        let mut state = self.state.lock();
        let dirty = state.store.remove(object);
        self.finish_event(&mut state, "delete", object.kind().as_str(), dirty)
    }

    /// Rebuild and publish regardless of what changed.
    pub fn rebuild(&self) {
        let mut state = self.state.lock();
        self.rebuild_locked(&mut state, "resync");
    }

    fn finish_event(&self, state: &mut State, operation: &str, kind: &str, dirty: bool) -> bool {
        self.metrics.record_event(operation, kind, dirty);
        if dirty {
            self.rebuild_locked(state, operation);
        } else {
            debug!(operation, kind, "Event does not affect the graph, skipping rebuild");
        }
        dirty
    }

    fn rebuild_locked(&self, state: &mut State, trigger: &str) {
        let span = crate::rebuild_span!(trigger);
        let _enter = span.enter();
        let started = Instant::now();

        let (dag, statuses) = self.builder.build(&state.store);
        let translation = translate(&dag);
        let mut published = Vec::new();
        for resource_type in ResourceType::ALL {
            let resources = translation.resources(resource_type);
            let count = resources.len();
            if let Some(version) = self.cache.update(resource_type, resources) {
                self.metrics.record_snapshot(resource_type.type_url(), version, count);
                published.push((resource_type, version));
            }
        }

        let invalid = statuses.iter().filter(|s| !s.is_valid()).count();
        self.metrics.record_rebuild(started.elapsed().as_secs_f64(), invalid);
        info!(
            objects = statuses.len(),
            invalid,
            published = ?published,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rebuilt routing graph"
        );
        state.statuses = statuses;
        state.translation = translation;
    }

    /// Status of every object seen by the last rebuild, sorted by key.
    pub fn statuses(&self) -> Vec<StatusUpdate> {
        self.state.lock().statuses.clone()
    }

    pub fn status(&self, key: &ObjectKey) -> Option<StatusUpdate> {
        self.state.lock().statuses.iter().find(|s| &s.key == key).cloned()
    }

    /// Typed resources from the last rebuild.
    pub fn translation(&self) -> Translation {
        self.state.lock().translation.clone()
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.cache.clone()
    }
}
