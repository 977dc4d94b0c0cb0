use crate::client::BrokerErrorReason;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide publish counters, shared by every send loop and every
/// client generation. All counters only ever grow.
pub struct MetricsSink {
    events_published: AtomicU64,
    published_bytes: AtomicU64,
    batches_published: AtomicU64,
    total_service_operations: AtomicU64,
    total_exceptions: AtomicU64,
    send_exceptions: AtomicU64,
    canceled_send_exceptions: AtomicU64,
    general_exceptions: AtomicU64,
    producer_restarts: AtomicU64,
    broker_failures: [AtomicU64; BrokerErrorReason::ALL.len()],
    start_time: Instant,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            published_bytes: AtomicU64::new(0),
            batches_published: AtomicU64::new(0),
            total_service_operations: AtomicU64::new(0),
            total_exceptions: AtomicU64::new(0),
            send_exceptions: AtomicU64::new(0),
            canceled_send_exceptions: AtomicU64::new(0),
            general_exceptions: AtomicU64::new(0),
            producer_restarts: AtomicU64::new(0),
            broker_failures: Default::default(),
            start_time: Instant::now(),
        }
    }

    /// One batch accepted by the broker.
    pub fn record_published(&self, events: u64, bytes: u64) {
        self.events_published.fetch_add(events, Ordering::Relaxed);
        self.published_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.batches_published.fetch_add(1, Ordering::Relaxed);
        self.total_service_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_canceled_send(&self) {
        self.record_send_exception();
        self.canceled_send_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Broker-reported failure: counted as a send exception, then routed to
    /// the per-reason counters.
    pub fn record_broker_failure(&self, reason: BrokerErrorReason) {
        self.record_send_exception();
        self.broker_failures[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_general_failure(&self) {
        self.record_send_exception();
        self.general_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.producer_restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_send_exception(&self) {
        self.total_exceptions.fetch_add(1, Ordering::Relaxed);
        self.send_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn published_bytes(&self) -> u64 {
        self.published_bytes.load(Ordering::Relaxed)
    }

    pub fn batches_published(&self) -> u64 {
        self.batches_published.load(Ordering::Relaxed)
    }

    pub fn total_service_operations(&self) -> u64 {
        self.total_service_operations.load(Ordering::Relaxed)
    }

    pub fn total_exceptions(&self) -> u64 {
        self.total_exceptions.load(Ordering::Relaxed)
    }

    pub fn send_exceptions(&self) -> u64 {
        self.send_exceptions.load(Ordering::Relaxed)
    }

    pub fn canceled_send_exceptions(&self) -> u64 {
        self.canceled_send_exceptions.load(Ordering::Relaxed)
    }

    pub fn general_exceptions(&self) -> u64 {
        self.general_exceptions.load(Ordering::Relaxed)
    }

    pub fn producer_restarts(&self) -> u64 {
        self.producer_restarts.load(Ordering::Relaxed)
    }

    pub fn broker_failures(&self, reason: BrokerErrorReason) -> u64 {
        self.broker_failures[reason.index()].load(Ordering::Relaxed)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Point-in-time copy of every counter. Counters are read one by one, so
    /// a snapshot taken under load is not a single atomic cut.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let duration_ms = self.elapsed_ms();
        let events_published = self.events_published();
        let events_per_sec = if duration_ms > 0 {
            events_published.saturating_mul(1000) / duration_ms
        } else {
            0
        };

        let broker_failures = BrokerErrorReason::ALL
            .iter()
            .filter_map(|reason| {
                let count = self.broker_failures(*reason);
                (count > 0).then(|| (reason.as_str().to_string(), count))
            })
            .collect();

        MetricsSnapshot {
            events_published,
            published_bytes: self.published_bytes(),
            batches_published: self.batches_published(),
            total_service_operations: self.total_service_operations(),
            total_exceptions: self.total_exceptions(),
            send_exceptions: self.send_exceptions(),
            canceled_send_exceptions: self.canceled_send_exceptions(),
            general_exceptions: self.general_exceptions(),
            producer_restarts: self.producer_restarts(),
            broker_failures,
            events_per_sec,
            duration_ms,
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub published_bytes: u64,
    pub batches_published: u64,
    pub total_service_operations: u64,
    pub total_exceptions: u64,
    pub send_exceptions: u64,
    pub canceled_send_exceptions: u64,
    pub general_exceptions: u64,
    pub producer_restarts: u64,
    pub broker_failures: BTreeMap<String, u64>,
    pub events_per_sec: u64,
    pub duration_ms: u64,
}
