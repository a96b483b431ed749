//! Backend endpoints and ordered partition sets.
//!
//! Grounded on `libamqpprox_backend.h`/`amqpprox_backendset.h` (file names
//! inferred from the data model in spec.md §3; the concrete fields mirror
//! what `amqpprox_connector.cpp` and `amqpprox_connectionlimitermanager.cpp`
//! assume a `Backend` carries).

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A target broker endpoint. Immutable after construction; identified by
/// `name`, which must be unique within a `BackendStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub datacenter: String,
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
    pub send_proxy: bool,
    pub tls_enabled: bool,
    pub dns_based: bool,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        datacenter: impl Into<String>,
        host: impl Into<String>,
        ip: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            datacenter: datacenter.into(),
            host: host.into(),
            ip,
            port,
            send_proxy: false,
            tls_enabled: false,
            dns_based: false,
        }
    }

    pub fn with_send_proxy(mut self, v: bool) -> Self {
        self.send_proxy = v;
        self
    }

    pub fn with_tls(mut self, v: bool) -> Self {
        self.tls_enabled = v;
        self
    }

    pub fn with_dns_based(mut self, v: bool) -> Self {
        self.dns_based = v;
        self
    }

    /// The `(host, port)` pair a DNS-based backend should be re-resolved
    /// against on every attempt.
    pub fn resolve_target(&self) -> (&str, u16) {
        if self.dns_based {
            (self.host.as_str(), self.port)
        } else {
            (self.host.as_str(), self.port)
        }
    }
}

/// An ordered partition: candidates within it are interchangeable.
pub type Partition = Vec<Arc<Backend>>;

/// An ordered sequence of partitions. Iteration proceeds partition-by-partition;
/// partitions are tried in order, candidates within a partition are
/// interchangeable. See spec.md §3.
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    partitions: Vec<Partition>,
}

impl BackendSet {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    pub fn single_partition(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            partitions: vec![backends],
        }
    }

    pub fn single_backend(backend: Arc<Backend>) -> Self {
        Self::single_partition(vec![backend])
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn total_backend_count(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_backend_count() == 0
    }

    /// Build a fresh [`MarkerSnapshot`] with every partition cursor at zero.
    pub fn new_marker_snapshot(&self) -> MarkerSnapshot {
        MarkerSnapshot {
            cursors: vec![0; self.partitions.len()],
        }
    }
}

/// A per-attempt snapshot of rotating partition cursors, so concurrent
/// sessions sharing a `BackendSet` fan out across candidates rather than all
/// starting at index 0.
#[derive(Debug, Clone, Default)]
pub struct MarkerSnapshot {
    cursors: Vec<usize>,
}

impl MarkerSnapshot {
    pub fn get(&self, partition: usize) -> usize {
        self.cursors.get(partition).copied().unwrap_or(0)
    }
}

/// A rotating set of live cursors, one per partition, shared by every
/// `ConnectionManager` built from the same `BackendSet` snapshot so
/// successive sessions start at different candidates (round-robin fairness
/// across the whole set, not just within one session's retries).
#[derive(Debug, Default)]
pub struct MarkerCursor {
    cursors: Vec<AtomicUsize>,
}

impl MarkerCursor {
    pub fn new(partition_count: usize) -> Self {
        Self {
            cursors: (0..partition_count).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Take a snapshot and advance the live cursor for `partition` by one,
    /// so the next caller starts further along.
    pub fn snapshot_and_advance(&self) -> MarkerSnapshot {
        let cursors = self
            .cursors
            .iter()
            .map(|c| c.fetch_add(1, Ordering::Relaxed))
            .collect();
        MarkerSnapshot { cursors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, dc: &str) -> Arc<Backend> {
        Arc::new(Backend::new(name, dc, "localhost", "127.0.0.1".parse().unwrap(), 5672))
    }

    #[test]
    fn total_backend_count_sums_every_partition() {
        let set = BackendSet::new(vec![
            vec![backend("a", "dc1"), backend("b", "dc1")],
            vec![backend("c", "dc2")],
        ]);
        assert_eq!(set.total_backend_count(), 3);
        assert_eq!(set.partition_count(), 2);
    }

    #[test]
    fn marker_cursor_advances_independently_per_partition() {
        let cursor = MarkerCursor::new(2);
        let s1 = cursor.snapshot_and_advance();
        let s2 = cursor.snapshot_and_advance();
        assert_eq!(s1.get(0), 0);
        assert_eq!(s2.get(0), 1);
        assert_eq!(s1.get(1), 0);
        assert_eq!(s2.get(1), 1);
    }
}
