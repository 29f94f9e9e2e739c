//! Atomic counters for hub session activity.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A thread-safe monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A thread-safe settable gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for all key hub operations. Shareable via `Arc`.
#[derive(Debug, Default)]
pub struct HubMetrics {
    /// Currently connected agent sessions.
    pub connected_agents: Gauge,
    /// Sessions accepted since start.
    pub sessions_opened: Counter,
    /// Sessions closed because a newer session for the same agent arrived.
    pub sessions_replaced: Counter,
    /// Heartbeat frames accepted for processing.
    pub heartbeats_total: Counter,
    /// Heartbeat frames shed by the per-window rate limit.
    pub heartbeats_rate_limited: Counter,
    /// Outbound frames shed because an agent queue was full.
    pub send_queue_drops: Counter,
    /// Inbound frames with an unrecognized type tag.
    pub frames_unknown: Counter,
    /// Inbound frames that failed to decode.
    pub frames_undecodable: Counter,
}
