//! Partition policies: transformations that re-partition a `BackendSet`.
//!
//! Grounded on spec.md §3/§8's affinity-policy invariants; the original's
//! analogous file is `libamqpprox_affinitypartitionpolicy.*` (not present in
//! the retrieved pack, so the split/preserve-order contract below is taken
//! directly from the spec rather than copied from source).

use std::sync::Arc;

use crate::backend::{Backend, BackendSet, Partition};

pub trait PartitionPolicy: Send + Sync {
    /// Re-partition `set`, applied in sequence by a `Farm` recomputing its
    /// `BackendSet`.
    fn apply(&self, set: &BackendSet) -> BackendSet;
}

/// Splits each input partition into `{preferred, other}` sub-partitions
/// based on whether a backend's datacenter matches the proxy's configured
/// datacenter. Preferred always sorts first. Empty sub-partitions are
/// dropped, so output partition count is at most `2 * input partition count`.
pub struct AffinityPartitionPolicy {
    local_datacenter: String,
}

impl AffinityPartitionPolicy {
    pub fn new(local_datacenter: impl Into<String>) -> Self {
        Self {
            local_datacenter: local_datacenter.into(),
        }
    }
}

impl PartitionPolicy for AffinityPartitionPolicy {
    fn apply(&self, set: &BackendSet) -> BackendSet {
        let mut output = Vec::new();
        for partition in set.partitions() {
            let (preferred, other): (Partition, Partition) = partition
                .iter()
                .cloned()
                .partition(|b| b.datacenter == self.local_datacenter);
            if !preferred.is_empty() {
                output.push(preferred);
            }
            if !other.is_empty() {
                output.push(other);
            }
        }
        BackendSet::new(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, dc: &str) -> Arc<Backend> {
        Arc::new(Backend::new(name, dc, "h", "127.0.0.1".parse().unwrap(), 5672))
    }

    #[test]
    fn splits_partition_by_datacenter_and_preserves_every_backend() {
        let set = BackendSet::new(vec![vec![
            backend("a", "dc1"),
            backend("b", "dc2"),
            backend("c", "dc1"),
        ]]);
        let policy = AffinityPartitionPolicy::new("dc1");
        let result = policy.apply(&set);

        assert!(result.partition_count() <= 2 * set.partition_count());
        assert_eq!(result.total_backend_count(), set.total_backend_count());
        assert_eq!(result.partitions()[0].len(), 2);
        assert!(result.partitions()[0].iter().all(|b| b.datacenter == "dc1"));
        assert_eq!(result.partitions()[1].len(), 1);
    }

    #[test]
    fn drops_empty_sub_partitions() {
        let set = BackendSet::new(vec![vec![backend("a", "dc1"), backend("b", "dc1")]]);
        let policy = AffinityPartitionPolicy::new("dc1");
        let result = policy.apply(&set);
        assert_eq!(result.partition_count(), 1);
    }

    #[test]
    fn multiple_input_partitions_each_split_independently() {
        let set = BackendSet::new(vec![
            vec![backend("a", "dc1"), backend("b", "dc2")],
            vec![backend("c", "dc2")],
        ]);
        let policy = AffinityPartitionPolicy::new("dc1");
        let result = policy.apply(&set);
        assert!(result.partition_count() <= 4);
        assert_eq!(result.total_backend_count(), 3);
    }
}
