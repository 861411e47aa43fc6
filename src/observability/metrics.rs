//! Thread-safe metrics collection system
//!
//! Atomic counters for connection lifecycle, inbound buffering, outbound
//! publishing and keep-alive checks, shared by every coordinator in the process.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Connection lifecycle
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    connections_lost: AtomicU64,
    active_connections: AtomicU64,

    // Inbound buffering
    messages_arrived: AtomicU64,
    messages_redelivered: AtomicU64,
    messages_acknowledged: AtomicU64,
    store_failures: AtomicU64,

    // Outbound
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    deliveries_completed: AtomicU64,

    // Keep-alive
    ping_checks: AtomicU64,
    ping_failures: AtomicU64,

    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            messages_arrived: AtomicU64::new(0),
            messages_redelivered: AtomicU64::new(0),
            messages_acknowledged: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            deliveries_completed: AtomicU64::new(0),
            ping_checks: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection lifecycle
    pub fn record_connect_attempt(&self, reconnect: bool) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if reconnect {
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A connected session ended, either lost or explicitly closed
    pub fn record_connection_ended(&self, lost: bool) {
        if lost {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // Inbound buffering
    pub fn record_message_arrived(&self) {
        self.messages_arrived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_messages_redelivered(&self, count: usize) {
        self.messages_redelivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_message_acknowledged(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Outbound
    pub fn record_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_completed(&self) {
        self.deliveries_completed.fetch_add(1, Ordering::Relaxed);
    }

    // Keep-alive
    pub fn record_ping_check(&self) {
        self.ping_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping_failure(&self) {
        self.ping_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let started_at = self.started_at.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(started_at),
            connections: ConnectionMetrics {
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                active_connections: self.active_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                arrived: self.messages_arrived.load(Ordering::Relaxed),
                redelivered: self.messages_redelivered.load(Ordering::Relaxed),
                acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
                store_failures: self.store_failures.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                deliveries_completed: self.deliveries_completed.load(Ordering::Relaxed),
            },
            keep_alive: KeepAliveMetrics {
                checks: self.ping_checks.load(Ordering::Relaxed),
                failures: self.ping_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Complete metrics snapshot for export
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub keep_alive: KeepAliveMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    pub reconnect_attempts: u64,
    pub connections_lost: u64,
    pub active_connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub arrived: u64,
    pub redelivered: u64,
    pub acknowledged: u64,
    pub store_failures: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub deliveries_completed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeepAliveMetrics {
    pub checks: u64,
    pub failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
