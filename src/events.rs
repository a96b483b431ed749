//! Named, typed fan-out event points.
//!
//! Grounded on `libamqpprox/amqpprox_eventsource.h`/`amqpprox_eventsourcesignal.h`:
//! a small set of named signals, each a synchronous multi-subscriber
//! broadcast. Subscribers get an RAII handle; dropping it (or calling
//! `release`) desubscribes. Emission runs every current subscriber in
//! registration order, on the emitter's own task - there is no hop to
//! another scheduler, matching the original's direct-call `emit`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use amqpprox_core::SessionId;

use crate::backend::Backend;

type Callback<Args> = Arc<dyn Fn(Args) + Send + Sync>;

struct Signal<Args: Clone> {
    subscribers: Mutex<Vec<(u64, Callback<Args>)>>,
    watermark: AtomicU64,
}

impl<Args: Clone + Send + Sync + 'static> Signal<Args> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            watermark: AtomicU64::new(0),
        })
    }

    fn subscribe(self: &Arc<Self>, cb: impl Fn(Args) + Send + Sync + 'static) -> Subscription {
        let id = self.watermark.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(cb)));
        Subscription {
            signal: Arc::downgrade(&(self.clone() as Arc<dyn Desubscribe>)),
            id,
        }
    }

    fn emit(&self, args: Args) {
        // Snapshot the subscriber list so callbacks may subscribe/desubscribe
        // without deadlocking, matching the original's copy-then-unlock emit.
        let snapshot: Vec<Callback<Args>> =
            self.subscribers.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in snapshot {
            cb(args.clone());
        }
    }

    fn desubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(cid, _)| *cid != id);
    }
}

trait Desubscribe: Send + Sync {
    fn desubscribe_dyn(&self, id: u64);
}

impl<Args: Clone + Send + Sync + 'static> Desubscribe for Signal<Args> {
    fn desubscribe_dyn(&self, id: u64) {
        self.desubscribe(id);
    }
}

/// RAII subscription handle. Desubscribes on drop, matching
/// `EventSubscriptionHandle`.
pub struct Subscription {
    signal: Weak<dyn Desubscribe>,
    id: u64,
}

impl Subscription {
    pub fn release(self) {
        // Drop runs the desubscribe.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.desubscribe_dyn(self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatisticsSnapshot {
    pub active_sessions: u64,
}

/// Central source of connection lifecycle events.
pub struct EventSource {
    connection_received: Arc<Signal<SessionId>>,
    connection_vhost_established: Arc<Signal<(SessionId, String)>>,
    connection_established: Arc<Signal<SessionId>>,
    connection_failed: Arc<Signal<Backend>>,
    broker_connection_snapped: Arc<Signal<SessionId>>,
    client_connection_snapped: Arc<Signal<SessionId>>,
    clean_disconnect: Arc<Signal<SessionId>>,
    statistics_available: Arc<Signal<StatisticsSnapshot>>,
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource {
    pub fn new() -> Self {
        Self {
            connection_received: Signal::new(),
            connection_vhost_established: Signal::new(),
            connection_established: Signal::new(),
            connection_failed: Signal::new(),
            broker_connection_snapped: Signal::new(),
            client_connection_snapped: Signal::new(),
            clean_disconnect: Signal::new(),
            statistics_available: Signal::new(),
        }
    }

    pub fn on_connection_received(
        &self,
        cb: impl Fn(SessionId) + Send + Sync + 'static,
    ) -> Subscription {
        self.connection_received.subscribe(cb)
    }

    pub fn emit_connection_received(&self, id: SessionId) {
        self.connection_received.emit(id);
    }

    pub fn on_connection_vhost_established(
        &self,
        cb: impl Fn((SessionId, String)) + Send + Sync + 'static,
    ) -> Subscription {
        self.connection_vhost_established.subscribe(cb)
    }

    pub fn emit_connection_vhost_established(&self, id: SessionId, vhost: String) {
        self.connection_vhost_established.emit((id, vhost));
    }

    pub fn on_connection_established(
        &self,
        cb: impl Fn(SessionId) + Send + Sync + 'static,
    ) -> Subscription {
        self.connection_established.subscribe(cb)
    }

    pub fn emit_connection_established(&self, id: SessionId) {
        self.connection_established.emit(id);
    }

    pub fn on_connection_failed(
        &self,
        cb: impl Fn(Backend) + Send + Sync + 'static,
    ) -> Subscription {
        self.connection_failed.subscribe(cb)
    }

    pub fn emit_connection_failed(&self, backend: Backend) {
        self.connection_failed.emit(backend);
    }

    pub fn on_broker_connection_snapped(
        &self,
        cb: impl Fn(SessionId) + Send + Sync + 'static,
    ) -> Subscription {
        self.broker_connection_snapped.subscribe(cb)
    }

    pub fn emit_broker_connection_snapped(&self, id: SessionId) {
        self.broker_connection_snapped.emit(id);
    }

    pub fn on_client_connection_snapped(
        &self,
        cb: impl Fn(SessionId) + Send + Sync + 'static,
    ) -> Subscription {
        self.client_connection_snapped.subscribe(cb)
    }

    pub fn emit_client_connection_snapped(&self, id: SessionId) {
        self.client_connection_snapped.emit(id);
    }

    pub fn on_clean_disconnect(
        &self,
        cb: impl Fn(SessionId) + Send + Sync + 'static,
    ) -> Subscription {
        self.clean_disconnect.subscribe(cb)
    }

    pub fn emit_clean_disconnect(&self, id: SessionId) {
        self.clean_disconnect.emit(id);
    }

    pub fn on_statistics_available(
        &self,
        cb: impl Fn(StatisticsSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.statistics_available.subscribe(cb)
    }

    pub fn emit_statistics_available(&self, snapshot: StatisticsSnapshot) {
        self.statistics_available.emit(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_to_all_current_subscribers_in_order() {
        let source = EventSource::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        let _sub_a = source.on_connection_received(move |id| order_a.lock().push((0, id.value())));
        let order_b = order.clone();
        let _sub_b = source.on_connection_received(move |id| order_b.lock().push((1, id.value())));

        source.emit_connection_received(SessionId::next());
        assert_eq!(order.lock().len(), 2);
        assert_eq!(order.lock()[0].0, 0);
        assert_eq!(order.lock()[1].0, 1);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let source = EventSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = source.on_connection_established(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        source.emit_connection_established(SessionId::next());
        drop(sub);
        source.emit_connection_established(SessionId::next());

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
