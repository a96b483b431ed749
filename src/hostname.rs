//! Reverse-maps endpoint addresses to hostnames so the identity spliced
//! into a forwarded `StartOk` (and handed to the auth interceptor) reads
//! as a hostname where reverse resolution succeeds, falling back to the
//! bare address otherwise.
//!
//! Grounded on spec.md §4.3's `hostname()` call and
//! `amqpprox_dnshostnamemapper.cpp`/`amqpprox_sessionstate.cpp`: prime a
//! cache from a session's own endpoints up front (`SessionState`'s
//! constructor priming), then serve lookups out of that cache without
//! touching the network again.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use tracing::{error, warn};

const CACHE_SIZE_WARN_LIMIT: usize = 50_000;

/// A trait seam for the reverse lookup itself, so tests can install a
/// deterministic mapping instead of touching real DNS.
#[async_trait::async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn reverse_lookup(&self, addr: IpAddr) -> Option<String>;
}

pub struct HickoryReverseResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryReverseResolver {
    pub fn from_system_config() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

#[async_trait::async_trait]
impl ReverseResolver for HickoryReverseResolver {
    async fn reverse_lookup(&self, addr: IpAddr) -> Option<String> {
        let response = self.resolver.reverse_lookup(addr).await.ok()?;
        response.iter().next().map(|name| name.to_string())
    }
}

/// Caches `IpAddr -> hostname`, primed from the endpoints of each session
/// as it's accepted.
pub struct HostnameMapper {
    reverse: Arc<dyn ReverseResolver>,
    cache: RwLock<HashMap<IpAddr, String>>,
}

impl HostnameMapper {
    pub fn new(reverse: Arc<dyn ReverseResolver>) -> Arc<Self> {
        Arc::new(Self {
            reverse,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve and cache the hostname for each of `endpoints`, skipping
    /// any address already cached. A lookup failure is logged and leaves
    /// that address unmapped rather than aborting the others.
    pub async fn prime(&self, endpoints: &[SocketAddr]) {
        for endpoint in endpoints {
            let addr = endpoint.ip();
            if self.cache.read().contains_key(&addr) {
                continue;
            }
            match self.reverse.reverse_lookup(addr).await {
                Some(hostname) => {
                    let mut cache = self.cache.write();
                    if cache.len() + 1 > CACHE_SIZE_WARN_LIMIT {
                        warn!(
                            size = cache.len() + 1,
                            limit = CACHE_SIZE_WARN_LIMIT,
                            "hostname cache larger than warning threshold"
                        );
                    }
                    cache.insert(addr, hostname);
                }
                None => error!(%addr, "failed to reverse resolve hostname"),
            }
        }
    }

    /// The cached hostname for `addr`, or the address itself (as a string)
    /// on a cache miss.
    pub fn map_to_hostname(&self, addr: IpAddr) -> String {
        if addr.is_unspecified() {
            return addr.to_string();
        }
        self.cache.read().get(&addr).cloned().unwrap_or_else(|| addr.to_string())
    }
}
