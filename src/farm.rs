//! Farms: named groups of backends with a selector and partition policies,
//! plus the process-wide stores that hold backends and farms.
//!
//! Grounded on spec.md §3 and §9's "global configuration mutated from the
//! control thread" design note, and on the store idiom from the teacher's
//! `agent-proxy/src/store/discovery.rs` (a `Mutex`-guarded map whose readers
//! copy out an immutable snapshot rather than holding the lock across await
//! points).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{Backend, BackendSet, MarkerCursor};
use crate::partition_policy::PartitionPolicy;
use crate::selector::{BackendSelector, RoundRobinBackendSelector};

/// A named group of backend members plus a selection/partition policy.
/// Mutations recompute `current_set` by starting from a single partition
/// containing every member, then applying each partition policy in order.
pub struct Farm {
    name: String,
    members: BTreeSet<String>,
    policies: Vec<Arc<dyn PartitionPolicy>>,
    selector: Arc<dyn BackendSelector>,
    current_set: Arc<BackendSet>,
    marker_cursor: Arc<MarkerCursor>,
}

impl Farm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
            policies: Vec::new(),
            selector: Arc::new(RoundRobinBackendSelector),
            current_set: Arc::new(BackendSet::default()),
            marker_cursor: Arc::new(MarkerCursor::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selector(&self) -> Arc<dyn BackendSelector> {
        self.selector.clone()
    }

    pub fn set_selector(&mut self, selector: Arc<dyn BackendSelector>) {
        self.selector = selector;
    }

    pub fn add_partition_policy(&mut self, policy: Arc<dyn PartitionPolicy>) {
        self.policies.push(policy);
    }

    pub fn add_member(&mut self, backend_name: impl Into<String>) {
        self.members.insert(backend_name.into());
    }

    pub fn remove_member(&mut self, backend_name: &str) {
        self.members.remove(backend_name);
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn current_set(&self) -> Arc<BackendSet> {
        self.current_set.clone()
    }

    pub fn marker_cursor(&self) -> Arc<MarkerCursor> {
        self.marker_cursor.clone()
    }

    /// Recompute `current_set` from `members` (resolved against `backends`)
    /// and the configured partition policies, in order.
    pub fn recompute(&mut self, backends: &BackendStore) {
        let base: Vec<_> = self
            .members
            .iter()
            .filter_map(|name| backends.get(name))
            .collect();
        let mut set = BackendSet::single_partition(base);
        for policy in &self.policies {
            set = policy.apply(&set);
        }
        self.marker_cursor = Arc::new(MarkerCursor::new(set.partition_count()));
        self.current_set = Arc::new(set);
    }
}

/// Process-wide store of backends by name, guarded by one lock as described
/// in spec.md §5.
#[derive(Default)]
pub struct BackendStore {
    backends: RwLock<BTreeMap<String, Arc<Backend>>>,
}

impl BackendStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, backend: Backend) {
        self.backends
            .write()
            .insert(backend.name.clone(), Arc::new(backend));
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }
}

/// Process-wide store of farms by name.
#[derive(Default)]
pub struct FarmStore {
    farms: RwLock<BTreeMap<String, Arc<RwLock<Farm>>>>,
}

impl FarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, farm: Farm) {
        self.farms
            .write()
            .insert(farm.name().to_string(), Arc::new(RwLock::new(farm)));
    }

    pub fn remove(&self, name: &str) -> Option<Arc<RwLock<Farm>>> {
        self.farms.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RwLock<Farm>>> {
        self.farms.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.farms.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition_policy::AffinityPartitionPolicy;

    #[test]
    fn recompute_resolves_members_and_applies_policies() {
        let backends = BackendStore::new();
        backends.insert(Backend::new("a", "dc1", "h1", "127.0.0.1".parse().unwrap(), 5672));
        backends.insert(Backend::new("b", "dc2", "h2", "127.0.0.2".parse().unwrap(), 5672));

        let mut farm = Farm::new("default");
        farm.add_member("a");
        farm.add_member("b");
        farm.add_partition_policy(Arc::new(AffinityPartitionPolicy::new("dc1")));
        farm.recompute(&backends);

        let set = farm.current_set();
        assert_eq!(set.total_backend_count(), 2);
        assert_eq!(set.partition_count(), 2);
    }

    #[test]
    fn recompute_skips_unknown_members() {
        let backends = BackendStore::new();
        backends.insert(Backend::new("a", "dc1", "h1", "127.0.0.1".parse().unwrap(), 5672));

        let mut farm = Farm::new("default");
        farm.add_member("a");
        farm.add_member("missing");
        farm.recompute(&backends);

        assert_eq!(farm.current_set().total_backend_count(), 1);
    }

    #[test]
    fn farm_store_round_trips() {
        let store = FarmStore::new();
        store.insert(Farm::new("f1"));
        assert!(store.get("f1").is_some());
        assert!(store.remove("f1").is_some());
        assert!(store.get("f1").is_none());
    }
}
