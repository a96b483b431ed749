//! Ties the vhost routing table, farm/backend stores, and admission
//! limiters together into the single call a session makes once it knows
//! the vhost it is opening: "give me a `ConnectionManager` to retry
//! against, or tell me why not."
//!
//! Grounded on spec.md §4.4 and `libamqpprox/amqpprox_connectionselector.cpp`.

use std::sync::Arc;

use crate::farm::{BackendStore, FarmStore};
use crate::limiter::ConnectionLimiterManager;
use crate::resourcemap::{ConnectionManager, MappingTarget, ResourceMap};
use crate::selector::RoundRobinBackendSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The vhost is rejected by a connection limiter.
    Limit,
    /// The vhost has no mapping and no default farm is configured.
    NoFarm,
    /// The vhost maps to a farm name that no longer exists.
    ErrorFarm,
    /// The farm (or direct backend mapping) resolved but has no candidates.
    NoBackend,
}

pub struct ConnectionSelector {
    resource_map: Arc<ResourceMap>,
    farms: Arc<FarmStore>,
    backends: Arc<BackendStore>,
    limiters: Arc<ConnectionLimiterManager>,
}

impl ConnectionSelector {
    pub fn new(
        resource_map: Arc<ResourceMap>,
        farms: Arc<FarmStore>,
        backends: Arc<BackendStore>,
        limiters: Arc<ConnectionLimiterManager>,
    ) -> Self {
        Self {
            resource_map,
            farms,
            backends,
            limiters,
        }
    }

    /// Resolve `vhost` to a `ConnectionManager`, checking admission first:
    /// a limited vhost is rejected before any farm lookup is attempted, so
    /// an operator throttling a vhost never pays for backend resolution.
    pub fn acquire_connection(&self, vhost: &str) -> Result<ConnectionManager, Status> {
        if !self.limiters.allow_new_connection_for_vhost(vhost) {
            return Err(Status::Limit);
        }

        let target = self
            .resource_map
            .get_mapping(vhost)
            .or_else(|| self.resource_map.default_farm().map(MappingTarget::Farm))
            .ok_or(Status::NoFarm)?;

        match target {
            MappingTarget::Backend(name) => {
                let backend = self.backends.get(&name).ok_or(Status::ErrorFarm)?;
                Ok(ConnectionManager::single_backend(backend))
            }
            MappingTarget::Farm(name) => {
                let farm = self.farms.get(&name).ok_or(Status::ErrorFarm)?;
                let farm = farm.read();
                let set = farm.current_set();
                if set.is_empty() {
                    return Err(Status::NoBackend);
                }
                let markers = farm.marker_cursor().snapshot_and_advance();
                Ok(ConnectionManager::new(set, markers, Arc::new(RoundRobinBackendSelector)))
            }
        }
    }

    pub fn connection_closed(&self, vhost: &str) {
        self.limiters.connection_closed(vhost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::farm::Farm;

    fn selector() -> ConnectionSelector {
        ConnectionSelector::new(
            Arc::new(ResourceMap::new()),
            Arc::new(FarmStore::new()),
            Arc::new(BackendStore::new()),
            Arc::new(ConnectionLimiterManager::new()),
        )
    }

    #[test]
    fn no_mapping_and_no_default_farm_is_no_farm() {
        let sel = selector();
        assert_eq!(sel.acquire_connection("/missing").unwrap_err(), Status::NoFarm);
    }

    #[test]
    fn mapping_to_unknown_farm_is_error_farm() {
        let sel = selector();
        sel.resource_map
            .set_mapping("/prod", MappingTarget::Farm("ghost".to_string()));
        assert_eq!(sel.acquire_connection("/prod").unwrap_err(), Status::ErrorFarm);
    }

    #[test]
    fn farm_with_no_members_is_no_backend() {
        let sel = selector();
        sel.farms.insert(Farm::new("empty"));
        sel.resource_map
            .set_mapping("/prod", MappingTarget::Farm("empty".to_string()));
        assert_eq!(sel.acquire_connection("/prod").unwrap_err(), Status::NoBackend);
    }

    #[test]
    fn limited_vhost_is_rejected_before_farm_lookup() {
        let sel = selector();
        sel.limiters.add_total_connection_limiter("/prod", 0);
        assert_eq!(sel.acquire_connection("/prod").unwrap_err(), Status::Limit);
    }

    #[test]
    fn direct_backend_mapping_resolves() {
        let sel = selector();
        sel.backends
            .insert(Backend::new("b1", "dc1", "h", "127.0.0.1".parse().unwrap(), 5672));
        sel.resource_map
            .set_mapping("/prod", MappingTarget::Backend("b1".to_string()));

        let manager = sel.acquire_connection("/prod").unwrap();
        assert_eq!(manager.get_connection(0).unwrap().name, "b1");
    }

    #[test]
    fn farm_mapping_resolves_via_members() {
        let sel = selector();
        sel.backends
            .insert(Backend::new("b1", "dc1", "h", "127.0.0.1".parse().unwrap(), 5672));
        let mut farm = Farm::new("default");
        farm.add_member("b1");
        farm.recompute(&sel.backends);
        sel.farms.insert(farm);
        sel.resource_map.set_default_farm(Some("default".to_string()));

        let manager = sel.acquire_connection("/anything").unwrap();
        assert_eq!(manager.get_connection(0).unwrap().name, "b1");
    }
}
