//! Metrics for the TCP data plane.
//!
//! Thread-safe counters for the events the translators and the connection
//! scheduler record: defence drops, client-address option outcomes, and
//! connection reuse broken down by the state the connection was reused from.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the counter by 1.
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Data-plane statistics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Non-SYN packets to a virtual IP without a matching service, dropped.
    pub defence_tcp_drop: Counter,

    /// Client-address option successfully injected.
    pub client_addr_inserted: Counter,
    /// Injection skipped: packet would exceed the path MTU.
    pub client_addr_fail_len: Counter,
    /// Injection skipped: connection is not IPv4.
    pub client_addr_fail_family: Counter,

    /// Full-NAT connections whose ISN was re-initialized on a fresh SYN.
    pub conn_reused: Counter,
    pub conn_reused_close: Counter,
    pub conn_reused_timewait: Counter,
    pub conn_reused_finwait: Counter,
    pub conn_reused_closewait: Counter,
    pub conn_reused_lastack: Counter,
    pub conn_reused_established: Counter,

    /// RST pairs synthesized on connection expiry.
    pub expire_rst_sent: Counter,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("defence_tcp_drop", self.defence_tcp_drop.get()),
            ("client_addr_inserted", self.client_addr_inserted.get()),
            ("client_addr_fail_len", self.client_addr_fail_len.get()),
            (
                "client_addr_fail_family",
                self.client_addr_fail_family.get(),
            ),
            ("conn_reused", self.conn_reused.get()),
            ("conn_reused_close", self.conn_reused_close.get()),
            ("conn_reused_timewait", self.conn_reused_timewait.get()),
            ("conn_reused_finwait", self.conn_reused_finwait.get()),
            ("conn_reused_closewait", self.conn_reused_closewait.get()),
            ("conn_reused_lastack", self.conn_reused_lastack.get()),
            (
                "conn_reused_established",
                self.conn_reused_established.get(),
            ),
            ("expire_rst_sent", self.expire_rst_sent.get()),
        ]
    }
}
