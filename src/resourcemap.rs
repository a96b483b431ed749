//! Vhost routing: the mapping from vhost name to a farm or direct backend,
//! plus the `ConnectionManager` a session carries across its retry attempts.
//!
//! Grounded on spec.md §3/§4.4.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{Backend, BackendSet, MarkerSnapshot};
use crate::selector::{BackendSelector, SingleBackendSelector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingTarget {
    Farm(String),
    Backend(String),
}

/// Mapping from vhost name to a farm or direct backend, plus an optional
/// proxy-wide default farm used when no explicit mapping exists.
#[derive(Default)]
pub struct ResourceMap {
    mappings: RwLock<BTreeMap<String, MappingTarget>>,
    default_farm: RwLock<Option<String>>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mapping(&self, vhost: impl Into<String>, target: MappingTarget) {
        self.mappings.write().insert(vhost.into(), target);
    }

    pub fn remove_mapping(&self, vhost: &str) {
        self.mappings.write().remove(vhost);
    }

    pub fn get_mapping(&self, vhost: &str) -> Option<MappingTarget> {
        self.mappings.read().get(vhost).cloned()
    }

    pub fn set_default_farm(&self, farm: Option<String>) {
        *self.default_farm.write() = farm;
    }

    pub fn default_farm(&self) -> Option<String> {
        self.default_farm.read().clone()
    }
}

/// A snapshot of a `BackendSet` plus the marker state and selector a single
/// connection attempt will retry against. Built once per attempt;
/// `get_connection` is pure given that snapshot.
#[derive(Clone)]
pub struct ConnectionManager {
    backend_set: Arc<BackendSet>,
    markers: MarkerSnapshot,
    selector: Arc<dyn BackendSelector>,
}

impl ConnectionManager {
    pub fn new(
        backend_set: Arc<BackendSet>,
        markers: MarkerSnapshot,
        selector: Arc<dyn BackendSelector>,
    ) -> Self {
        Self {
            backend_set,
            markers,
            selector,
        }
    }

    pub fn single_backend(backend: Arc<Backend>) -> Self {
        let set = Arc::new(BackendSet::single_backend(backend));
        let markers = set.new_marker_snapshot();
        Self {
            backend_set: set,
            markers,
            selector: Arc::new(SingleBackendSelector),
        }
    }

    pub fn get_connection(&self, retry_count: usize) -> Option<Arc<Backend>> {
        self.selector
            .select(&self.backend_set, &self.markers, retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_map_prefers_explicit_mapping_over_default() {
        let map = ResourceMap::new();
        map.set_default_farm(Some("default".to_string()));
        map.set_mapping("/prod", MappingTarget::Farm("prod-farm".to_string()));

        assert_eq!(
            map.get_mapping("/prod"),
            Some(MappingTarget::Farm("prod-farm".to_string()))
        );
        assert_eq!(map.get_mapping("/unmapped"), None);
        assert_eq!(map.default_farm(), Some("default".to_string()));
    }

    #[test]
    fn single_backend_manager_yields_once() {
        let backend = Arc::new(Backend::new(
            "b1",
            "dc1",
            "h",
            "127.0.0.1".parse().unwrap(),
            5672,
        ));
        let manager = ConnectionManager::single_backend(backend.clone());
        assert_eq!(manager.get_connection(0).unwrap().name, backend.name);
        assert!(manager.get_connection(1).is_none());
    }
}
