//! Statistics sink.
//!
//! The engine reports through [`StatsSink`] and never waits on it. Aggregation
//! and display belong to whoever implements the trait.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Fire-and-forget statistics interface.
pub trait StatsSink: Send + Sync {
    /// A client connection was accepted.
    fn on_connection_opened(&self);
    /// A client session was torn down.
    fn on_connection_closed(&self);
    /// A GET was answered from cache.
    fn on_cache_hit(&self);
    /// A cacheable GET had to go upstream.
    fn on_cache_miss(&self);
    /// A request was rejected by the blacklist.
    fn on_request_blocked(&self);

    /// Current totals, if this sink keeps any.
    fn report(&self) -> Option<StatsSnapshot> {
        None
    }
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn on_connection_opened(&self) {}
    fn on_connection_closed(&self) {}
    fn on_cache_hit(&self) {}
    fn on_cache_miss(&self) {}
    fn on_request_blocked(&self) {}
}

/// Lock-free counters implementing [`StatsSink`].
#[derive(Debug, Default)]
pub struct ProxyStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    blocked_requests: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub blocked_requests: u64,
}

impl StatsSnapshot {
    /// Fraction of cacheable GETs answered from cache, in `0.0..=1.0`.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

impl ProxyStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the cumulative counters. Active connections are left alone.
    pub fn reset(&self) {
        self.total_connections.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.blocked_requests.store(0, Ordering::Relaxed);
    }
}

impl StatsSink for ProxyStats {
    fn on_connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    fn on_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_request_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> Option<StatsSnapshot> {
        Some(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_events() {
        let stats = ProxyStats::new();
        stats.on_connection_opened();
        stats.on_connection_opened();
        stats.on_connection_closed();
        stats.on_cache_hit();
        stats.on_cache_miss();
        stats.on_cache_miss();
        stats.on_request_blocked();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 2);
        assert_eq!(snap.blocked_requests, 1);
        assert!((snap.hit_ratio() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn active_never_underflows() {
        let stats = ProxyStats::new();
        stats.on_connection_closed();
        assert_eq!(stats.snapshot().active_connections, 0);
    }

    #[test]
    fn reset_keeps_active() {
        let stats = ProxyStats::new();
        stats.on_connection_opened();
        stats.on_cache_hit();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 0);
        assert_eq!(snap.cache_hits, 0);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn only_counting_sinks_report() {
        assert!(NoopStats.report().is_none());

        let stats = ProxyStats::new();
        stats.on_request_blocked();
        assert_eq!(stats.report().unwrap().blocked_requests, 1);
    }

    #[test]
    fn hit_ratio_without_lookups() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
    }
}
