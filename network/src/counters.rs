// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network metrics and counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Network metrics collector
#[derive(Debug, Clone)]
pub struct NetworkMetrics {
    inner: Arc<NetworkMetricsInner>,
}

#[derive(Debug, Default)]
struct NetworkMetricsInner {
    // Connection metrics
    connection_attempts: AtomicU64,
    active_connections: AtomicU64,
    failed_connections: AtomicU64,
    rejected_negotiations: AtomicU64,
    retries_scheduled: AtomicU64,

    // Message metrics
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_relayed: AtomicU64,
    duplicates_received: AtomicU64,
    ack_timeouts: AtomicU64,

    // Discovery metrics
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    datagram_errors: AtomicU64,
}

impl NetworkMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkMetricsInner::default()),
        }
    }

    // Connection metrics
    pub fn inc_connection_attempts(&self) {
        self.inner.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_negotiations(&self) {
        self.inner.rejected_negotiations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries_scheduled(&self) {
        self.inner.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    // Message metrics
    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_relayed(&self) {
        self.inner.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates_received(&self) {
        self.inner.duplicates_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ack_timeouts(&self) {
        self.inner.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // Discovery metrics
    pub fn inc_datagrams_sent(&self) {
        self.inner.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_datagrams_received(&self) {
        self.inner.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_datagram_errors(&self) {
        self.inner.datagram_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Getters
    pub fn get_connection_attempts(&self) -> u64 {
        self.inner.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> u64 {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn get_failed_connections(&self) -> u64 {
        self.inner.failed_connections.load(Ordering::Relaxed)
    }

    pub fn get_retries_scheduled(&self) -> u64 {
        self.inner.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn get_messages_sent(&self) -> u64 {
        self.inner.messages_sent.load(Ordering::Relaxed)
    }

    pub fn get_messages_received(&self) -> u64 {
        self.inner.messages_received.load(Ordering::Relaxed)
    }

    pub fn get_messages_relayed(&self) -> u64 {
        self.inner.messages_relayed.load(Ordering::Relaxed)
    }

    pub fn get_duplicates_received(&self) -> u64 {
        self.inner.duplicates_received.load(Ordering::Relaxed)
    }

    pub fn get_datagrams_received(&self) -> u64 {
        self.inner.datagrams_received.load(Ordering::Relaxed)
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}
