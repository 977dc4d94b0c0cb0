use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};

/// Where in the publish pipeline a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A send was canceled or timed out.
    CanceledSend,
    /// The broker rejected or failed a send.
    BrokerSend,
    /// Any other failure while building or sending a batch.
    GeneralSend,
    /// The client handle failed and the generation was restarted.
    ClientFault,
}

/// One failure captured verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    /// Short error kind, e.g. `broker/service_busy`.
    pub kind: String,
    pub message: String,
    /// Client generation the failure belongs to.
    pub generation: u64,
}

impl ErrorRecord {
    pub fn new(
        category: ErrorCategory,
        kind: impl Into<String>,
        message: impl Into<String>,
        generation: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            kind: kind.into(),
            message: message.into(),
            generation,
        }
    }
}

/// Unbounded, lock-free, append-only log of failures. The publisher only
/// appends; whoever owns the collector is responsible for draining it.
#[derive(Default)]
pub struct ErrorCollector {
    records: SegQueue<ErrorRecord>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: ErrorRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and return everything collected so far, oldest first.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        let mut drained = Vec::with_capacity(self.records.len());
        while let Some(record) = self.records.pop() {
            drained.push(record);
        }
        drained
    }
}
