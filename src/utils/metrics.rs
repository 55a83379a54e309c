//! RPC Metrics
//!
//! Atomic counters describing the traffic of one client or server instance.
//! Each engine owns an `Arc<Metrics>`; callers can read it through
//! `RpcClient::metrics` / `RpcServer::metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for one engine instance
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Handshakes that reached CONNECTED
    pub handshakes_success: AtomicU64,
    /// Handshakes abandoned or rejected
    pub handshakes_failed: AtomicU64,
    /// Requests sent by `fire`
    pub requests_fired: AtomicU64,
    /// Requests that hit their deadline
    pub requests_timed_out: AtomicU64,
    /// Responses matched to a pending request
    pub responses_received: AtomicU64,
    /// Requests dispatched by the server
    pub requests_dispatched: AtomicU64,
    /// Handler failures (no handler, handler error, panic)
    pub handler_errors: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            requests_fired: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating so a double close never wraps the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request leaving the client
    pub fn request_fired(&self, byte_count: u64) {
        self.requests_fired.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response matched on the client
    pub fn response_received(&self, byte_count: u64) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a request handled by the server
    pub fn request_dispatched(&self, bytes_in: u64, bytes_out: u64) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            requests_fired: self.requests_fired.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            handshakes_total = s.handshakes_total,
            handshakes_success = s.handshakes_success,
            handshakes_failed = s.handshakes_failed,
            requests_fired = s.requests_fired,
            requests_timed_out = s.requests_timed_out,
            responses_received = s.responses_received,
            requests_dispatched = s.requests_dispatched,
            handler_errors = s.handler_errors,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            uptime_seconds = s.uptime_seconds,
            "RPC metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub requests_fired: u64,
    pub requests_timed_out: u64,
    pub responses_received: u64,
    pub requests_dispatched: u64,
    pub handler_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.connection_established();
        m.connection_established();
        m.connection_closed();
        m.request_fired(10);
        m.response_received(4);
        m.request_dispatched(7, 3);

        let s = m.snapshot();
        assert_eq!(s.connections_total, 2);
        assert_eq!(s.connections_active, 1);
        assert_eq!(s.requests_fired, 1);
        assert_eq!(s.bytes_sent, 13);
        assert_eq!(s.bytes_received, 11);
    }

    #[test]
    fn test_active_gauge_never_wraps() {
        let m = Metrics::new();
        m.connection_closed();
        assert_eq!(m.snapshot().connections_active, 0);
    }
}
