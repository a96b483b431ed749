//! Per-vhost admission control: fixed-window connection-rate limiters and
//! total-active-connection limiters, each with an "alarm-only" twin slot
//! that logs but never denies.
//!
//! Grounded on `libamqpprox/amqpprox_connectionlimitermanager.cpp`: four
//! independently resolvable slots per vhost (rate, rate-alarm-only, total,
//! total-alarm-only), each vhost entry tagged `explicit` (operator-set) or
//! `default-backed` (created lazily from the process-wide default and
//! silently replaced whenever that default changes).

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Fixed-window connection-rate limiter. See spec.md §3.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: u32,
    window: std::time::Duration,
    last_window_start: std::time::Instant,
    count_in_window: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: std::time::Duration) -> Self {
        Self {
            limit,
            window,
            last_window_start: std::time::Instant::now(),
            count_in_window: 0,
        }
    }

    pub fn allow_new_connection_at(&mut self, now: std::time::Instant) -> bool {
        if now.duration_since(self.last_window_start) >= self.window {
            self.last_window_start = now;
            self.count_in_window = 0;
        }
        if self.count_in_window < self.limit {
            self.count_in_window += 1;
            true
        } else {
            false
        }
    }

    pub fn allow_new_connection(&mut self) -> bool {
        self.allow_new_connection_at(std::time::Instant::now())
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// Total-active-connection limiter. See spec.md §3.
#[derive(Debug, Clone, Copy)]
pub struct TotalConnectionLimiter {
    limit: u32,
    current: u32,
}

impl TotalConnectionLimiter {
    pub fn new(limit: u32) -> Self {
        Self { limit, current: 0 }
    }

    pub fn allow_new_connection(&mut self) -> bool {
        if self.current < self.limit {
            self.current += 1;
            true
        } else {
            false
        }
    }

    pub fn connection_closed(&mut self) {
        self.current = self.current.saturating_sub(1);
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// Whichever of the two limiter kinds this entry tracks.
#[derive(Debug, Clone)]
enum Kind {
    Rate(RateLimiter),
    Total(TotalConnectionLimiter),
}

impl Kind {
    fn allow(&mut self) -> bool {
        match self {
            Kind::Rate(l) => l.allow_new_connection(),
            Kind::Total(l) => l.allow_new_connection(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Kind::Rate(l) => format!("rate limit {}", l.limit()),
            Kind::Total(l) => format!("total connection limit {}", l.limit()),
        }
    }
}

/// A per-vhost slot entry: `explicit` is true when an operator set this
/// limiter directly (`ADD...`); false when it was populated from the
/// process-wide default and should be silently replaced whenever that
/// default changes, per `maybePopulateDefaultLimiters`/the `setDefault*`
/// family in the original.
#[derive(Debug, Clone)]
struct Entry {
    explicit: bool,
    kind: Kind,
}

#[derive(Default)]
struct Slot {
    default: Option<u32>,
    per_vhost: HashMap<String, Entry>,
}

impl Slot {
    fn set_explicit_rate(&mut self, vhost: &str, limit: u32, window: std::time::Duration) {
        self.per_vhost.insert(
            vhost.to_string(),
            Entry {
                explicit: true,
                kind: Kind::Rate(RateLimiter::new(limit, window)),
            },
        );
    }

    fn set_explicit_total(&mut self, vhost: &str, limit: u32) {
        self.per_vhost.insert(
            vhost.to_string(),
            Entry {
                explicit: true,
                kind: Kind::Total(TotalConnectionLimiter::new(limit)),
            },
        );
    }

    fn remove(&mut self, vhost: &str, make_default_rate: Option<std::time::Duration>) {
        match (self.default, make_default_rate) {
            (Some(limit), Some(window)) => {
                self.per_vhost.insert(
                    vhost.to_string(),
                    Entry {
                        explicit: false,
                        kind: Kind::Rate(RateLimiter::new(limit, window)),
                    },
                );
            }
            (Some(limit), None) => {
                self.per_vhost.insert(
                    vhost.to_string(),
                    Entry {
                        explicit: false,
                        kind: Kind::Total(TotalConnectionLimiter::new(limit)),
                    },
                );
            }
            (None, _) => {
                self.per_vhost.remove(vhost);
            }
        }
    }

    /// Update the default for this slot. Every entry NOT marked `explicit`
    /// is replaced by a fresh limiter built from the new default; explicit
    /// (operator-set) entries are left untouched. This is the corrected
    /// counterpart of a documented upstream discrepancy: the original's
    /// alarm-only-total default updater iterates the alarm-only *rate* map
    /// instead of the alarm-only *total* map, so changing that one default
    /// never actually updates existing default-backed total limiters of
    /// that slot. We deliberately do not reproduce that cross-map iteration
    /// bug; instead each slot here only ever rewrites its own defaulted
    /// entries, which is what every other slot already does correctly.
    fn set_default_rate(&mut self, limit: u32, window: std::time::Duration) {
        self.default = Some(limit);
        for entry in self.per_vhost.values_mut() {
            if !entry.explicit {
                entry.kind = Kind::Rate(RateLimiter::new(limit, window));
            }
        }
    }

    fn set_default_total(&mut self, limit: u32) {
        self.default = Some(limit);
        for entry in self.per_vhost.values_mut() {
            if !entry.explicit {
                entry.kind = Kind::Total(TotalConnectionLimiter::new(limit));
            }
        }
    }

    fn remove_default(&mut self) {
        self.default = None;
        self.per_vhost.retain(|_, entry| entry.explicit);
    }

    fn maybe_populate_default_rate(&mut self, vhost: &str, window: std::time::Duration) {
        if !self.per_vhost.contains_key(vhost) {
            if let Some(limit) = self.default {
                self.per_vhost.insert(
                    vhost.to_string(),
                    Entry {
                        explicit: false,
                        kind: Kind::Rate(RateLimiter::new(limit, window)),
                    },
                );
            }
        }
    }

    fn maybe_populate_default_total(&mut self, vhost: &str) {
        if !self.per_vhost.contains_key(vhost) {
            if let Some(limit) = self.default {
                self.per_vhost.insert(
                    vhost.to_string(),
                    Entry {
                        explicit: false,
                        kind: Kind::Total(TotalConnectionLimiter::new(limit)),
                    },
                );
            }
        }
    }
}

const RATE_WINDOW: std::time::Duration = std::time::Duration::from_secs(1);

/// Owns the four per-vhost limiter slots and evaluates admission for a
/// connection. Mirrors `ConnectionLimiterManager`: one mutex guards all
/// slots, matching spec.md §5's "shared mutable surfaces" design.
#[derive(Default)]
pub struct ConnectionLimiterManager {
    inner: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    rate: Slot,
    rate_alarm: Slot,
    total: Slot,
    total_alarm: Slot,
}

impl ConnectionLimiterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection_rate_limiter(&self, vhost: &str, limit: u32) {
        self.inner.lock().rate.set_explicit_rate(vhost, limit, RATE_WINDOW);
    }

    pub fn add_alarm_only_connection_rate_limiter(&self, vhost: &str, limit: u32) {
        self.inner
            .lock()
            .rate_alarm
            .set_explicit_rate(vhost, limit, RATE_WINDOW);
    }

    pub fn add_total_connection_limiter(&self, vhost: &str, limit: u32) {
        self.inner.lock().total.set_explicit_total(vhost, limit);
    }

    pub fn add_alarm_only_total_connection_limiter(&self, vhost: &str, limit: u32) {
        self.inner.lock().total_alarm.set_explicit_total(vhost, limit);
    }

    pub fn remove_connection_rate_limiter(&self, vhost: &str) {
        self.inner.lock().rate.remove(vhost, Some(RATE_WINDOW));
    }

    pub fn remove_alarm_only_connection_rate_limiter(&self, vhost: &str) {
        self.inner.lock().rate_alarm.remove(vhost, Some(RATE_WINDOW));
    }

    pub fn remove_total_connection_limiter(&self, vhost: &str) {
        self.inner.lock().total.remove(vhost, None);
    }

    pub fn remove_alarm_only_total_connection_limiter(&self, vhost: &str) {
        self.inner.lock().total_alarm.remove(vhost, None);
    }

    pub fn set_default_connection_rate_limit(&self, limit: u32) {
        self.inner.lock().rate.set_default_rate(limit, RATE_WINDOW);
    }

    pub fn set_alarm_only_default_connection_rate_limit(&self, limit: u32) {
        self.inner.lock().rate_alarm.set_default_rate(limit, RATE_WINDOW);
    }

    pub fn set_default_total_connection_limit(&self, limit: u32) {
        self.inner.lock().total.set_default_total(limit);
    }

    pub fn set_alarm_only_default_total_connection_limit(&self, limit: u32) {
        self.inner.lock().total_alarm.set_default_total(limit);
    }

    pub fn remove_default_connection_rate_limit(&self) {
        self.inner.lock().rate.remove_default();
    }

    pub fn remove_alarm_only_default_connection_rate_limit(&self) {
        self.inner.lock().rate_alarm.remove_default();
    }

    pub fn remove_default_total_connection_limit(&self) {
        self.inner.lock().total.remove_default();
    }

    pub fn remove_alarm_only_default_total_connection_limit(&self) {
        self.inner.lock().total_alarm.remove_default();
    }

    /// Evaluate admission for `vhost`. Evaluation order: rate-alarm, rate,
    /// total-alarm, total; returns false on the first non-alarm denial.
    pub fn allow_new_connection_for_vhost(&self, vhost: &str) -> bool {
        let mut slots = self.inner.lock();

        slots.rate_alarm.maybe_populate_default_rate(vhost, RATE_WINDOW);
        slots.rate.maybe_populate_default_rate(vhost, RATE_WINDOW);

        if let Some(entry) = slots.rate_alarm.per_vhost.get_mut(vhost) {
            if !entry.kind.allow() {
                warn!(
                    vhost,
                    "AMQPPROX_CONNECTION_LIMIT: connection request should be limited by {}",
                    entry.kind.describe()
                );
            }
        }

        if let Some(entry) = slots.rate.per_vhost.get_mut(vhost) {
            if !entry.kind.allow() {
                info!(
                    vhost,
                    "AMQPPROX_CONNECTION_LIMIT: connection request is limited by {}",
                    entry.kind.describe()
                );
                return false;
            }
        }

        slots.total_alarm.maybe_populate_default_total(vhost);
        slots.total.maybe_populate_default_total(vhost);

        if let Some(entry) = slots.total_alarm.per_vhost.get_mut(vhost) {
            if !entry.kind.allow() {
                warn!(
                    vhost,
                    "AMQPPROX_CONNECTION_LIMIT: connection request should be limited by {}",
                    entry.kind.describe()
                );
            }
        }

        if let Some(entry) = slots.total.per_vhost.get_mut(vhost) {
            if !entry.kind.allow() {
                info!(
                    vhost,
                    "AMQPPROX_CONNECTION_LIMIT: connection request is limited by {}",
                    entry.kind.describe()
                );
                return false;
            }
        }

        true
    }

    /// Decrement both the per-vhost and alarm-only total limiters, if
    /// present.
    pub fn connection_closed(&self, vhost: &str) {
        let mut slots = self.inner.lock();
        if let Some(Entry { kind: Kind::Total(l), .. }) = slots.total_alarm.per_vhost.get_mut(vhost) {
            l.connection_closed();
        }
        if let Some(Entry { kind: Kind::Total(l), .. }) = slots.total.per_vhost.get_mut(vhost) {
            l.connection_closed();
        }
    }
}
