//! Per-connection metrics
//!
//! Atomic counters updated from the session and the comms tasks, read back
//! as a serialisable [`MetricsSnapshot`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Counters for one client session
pub struct SessionMetrics {
    // Traffic (hot path)
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    acks_received: AtomicU64,
    publishes_delivered: AtomicU64,
    pings_sent: AtomicU64,
    in_flight_high_water: AtomicU64,

    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    connected_since_ms: AtomicI64,

    // Recovery
    messages_restored: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            publishes_delivered: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            in_flight_high_water: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            connected_since_ms: AtomicI64::new(0),
            messages_restored: AtomicU64::new(0),
        }
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_delivered(&self) {
        self.publishes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the highest in-flight count seen
    pub fn observe_in_flight(&self, in_flight: u16) {
        self.in_flight_high_water
            .fetch_max(u64::from(in_flight), Ordering::Relaxed);
    }

    pub fn record_restored(&self, count: u64) {
        self.messages_restored.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mark_disconnected();
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since_ms.store(0, Ordering::Relaxed);
    }

    /// Duration of the current connection in whole seconds (pure function)
    fn connection_duration_seconds(&self, now: DateTime<Utc>) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let since = self.connected_since_ms.load(Ordering::Relaxed);
        if since <= 0 {
            return 0;
        }
        let elapsed_ms = now.timestamp_millis().saturating_sub(since).max(0);
        (elapsed_ms / 1000) as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot {
            traffic: TrafficMetrics {
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                acks_received: self.acks_received.load(Ordering::Relaxed),
                publishes_delivered: self.publishes_delivered.load(Ordering::Relaxed),
                pings_sent: self.pings_sent.load(Ordering::Relaxed),
                in_flight_high_water: self.in_flight_high_water.load(Ordering::Relaxed),
            },
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration_seconds(now),
            },
            messages_restored: self.messages_restored.load(Ordering::Relaxed),
            timestamp: now,
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub traffic: TrafficMetrics,
    pub connection: ConnectionMetrics,
    pub messages_restored: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub acks_received: u64,
    pub publishes_delivered: u64,
    pub pings_sent: u64,
    pub in_flight_high_water: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub connection_duration_seconds: u64,
}
