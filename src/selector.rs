//! Backend selection: a stateless function `(BackendSet, MarkerSnapshot,
//! retryCount) -> Backend?`.
//!
//! Grounded on spec.md §3/§4.4/§8: the round-robin selector never mutates
//! its inputs, which is what lets `ConnectionManager` be built once per
//! connection attempt and reused across retries without coordination beyond
//! the marker snapshot taken at construction.

use std::sync::Arc;

use crate::backend::{Backend, BackendSet, MarkerSnapshot};

pub trait BackendSelector: Send + Sync {
    fn select(
        &self,
        set: &BackendSet,
        markers: &MarkerSnapshot,
        retry_count: usize,
    ) -> Option<Arc<Backend>>;
}

/// Iterates partition 0 starting at `markers[0]` (wrapping), then partition
/// 1 starting at `markers[1]`, and so on; yields `None` once `retry_count`
/// exceeds the total candidate count across all partitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinBackendSelector;

impl BackendSelector for RoundRobinBackendSelector {
    fn select(
        &self,
        set: &BackendSet,
        markers: &MarkerSnapshot,
        retry_count: usize,
    ) -> Option<Arc<Backend>> {
        let mut remaining = retry_count;
        for (partition_index, partition) in set.partitions().iter().enumerate() {
            if partition.is_empty() {
                continue;
            }
            if remaining < partition.len() {
                let start = markers.get(partition_index);
                let index = (start + remaining) % partition.len();
                return Some(partition[index].clone());
            }
            remaining -= partition.len();
        }
        None
    }
}

/// A null selector used for a synthetic single-backend `ConnectionManager`
/// (vhost mapped directly to a BACKEND rather than a FARM): returns the
/// backend at retry 0 and `None` thereafter, matching spec.md §4.4.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleBackendSelector;

impl BackendSelector for SingleBackendSelector {
    fn select(
        &self,
        set: &BackendSet,
        _markers: &MarkerSnapshot,
        retry_count: usize,
    ) -> Option<Arc<Backend>> {
        if retry_count != 0 {
            return None;
        }
        set.partitions().first()?.first().cloned()
    }
}
