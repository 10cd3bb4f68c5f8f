//! Observability and Metrics
//!
//! Atomic counters for listener, handshake and codec activity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for connection and record activity
#[derive(Debug)]
pub struct Metrics {
    /// Raw connections accepted by a listener
    pub connections_accepted: AtomicU64,
    /// Connections refused by the authorization hook
    pub connections_denied: AtomicU64,
    /// Connections currently in the `Connected` state
    pub connections_active: AtomicU64,
    /// Total handshake attempts (both roles)
    pub handshakes_total: AtomicU64,
    /// Handshakes that reached `Connected`
    pub handshakes_success: AtomicU64,
    /// Handshakes that ended in `Disconnected`
    pub handshakes_failed: AtomicU64,
    /// Handshakes that negotiated TLS
    pub handshakes_encrypted: AtomicU64,
    /// Records written to a connection
    pub records_sent: AtomicU64,
    /// Records read from a connection
    pub records_received: AtomicU64,
    /// Record bytes written
    pub bytes_sent: AtomicU64,
    /// Record bytes read
    pub bytes_received: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_denied: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            handshakes_encrypted: AtomicU64::new(0),
            records_sent: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_denied(&self) {
        self.connections_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a connection dropped before reaching Connected never incremented
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self, encrypted: bool) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        if encrypted {
            self.handshakes_encrypted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, byte_count: u64) {
        self.records_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_received(&self, byte_count: u64) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_denied: self.connections_denied.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            handshakes_encrypted: self.handshakes_encrypted.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_accepted = snapshot.connections_accepted,
            connections_denied = snapshot.connections_denied,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            handshakes_encrypted = snapshot.handshakes_encrypted,
            records_sent = snapshot.records_sent,
            records_received = snapshot.records_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_denied: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub handshakes_encrypted: u64,
    pub records_sent: u64,
    pub records_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
