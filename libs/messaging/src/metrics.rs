//! Messaging Metrics Recorder
//!
//! Lock-free counters for the send/receive paths. Recording is
//! fire-and-forget: calls never block and never fail into the hot path.
//! A metrics backend can poll snapshots at its own cadence.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metrics recorder shared by all connections of one service
#[derive(Clone, Default)]
pub struct MessagingMetrics {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    requests_handled: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    request_errors: AtomicU64,
    in_flight: AtomicI64,
    latency_total_ns: AtomicU64,
    latency_count: AtomicU64,
    latency_max_ns: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub requests_handled: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub request_errors: u64,
    pub in_flight: i64,
    pub avg_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MessagingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_request_sent(&self, payload_bytes: usize) {
        self.inner.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_sent
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_response(&self, payload_bytes: usize, latency: Duration) {
        self.inner
            .responses_received
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);

        let nanos = latency.as_nanos() as u64;
        self.inner
            .latency_total_ns
            .fetch_add(nanos, Ordering::Relaxed);
        self.inner.latency_count.fetch_add(1, Ordering::Relaxed);
        self.inner
            .latency_max_ns
            .fetch_max(nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_request_failed(&self) {
        self.inner.request_errors.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_request_handled(&self, payload_bytes: usize) {
        self.inner.requests_handled.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(payload_bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.inner.latency_count.load(Ordering::Relaxed);
        let total = self.inner.latency_total_ns.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_sent: self.inner.requests_sent.load(Ordering::Relaxed),
            responses_received: self.inner.responses_received.load(Ordering::Relaxed),
            requests_handled: self.inner.requests_handled.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            request_errors: self.inner.request_errors.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            avg_latency_ns: if count > 0 { total / count } else { 0 },
            max_latency_ns: self.inner.latency_max_ns.load(Ordering::Relaxed),
        }
    }
}
