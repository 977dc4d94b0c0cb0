//! Interface to the broker client library, plus the event and batch types
//! that flow through it.

mod http;
mod mock;

pub use http::{HttpBatchClient, HttpClientFactory};
pub use mock::{FaultPlan, MockClient, MockClientFactory, MockStats};

use crate::config::Config;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Fixed framing cost of an empty batch.
pub const BATCH_OVERHEAD_BYTES: usize = 24;
/// Fixed framing cost of one event inside a batch.
pub const EVENT_OVERHEAD_BYTES: usize = 16;

/// Hyphenated UUID text.
const UUID_PROPERTY_BYTES: usize = 36;
/// Widest decimal `u64`.
const SEQUENCE_PROPERTY_BYTES: usize = 20;
/// Longest RFC 3339 timestamp we emit (nanosecond precision, `+00:00`).
const TIMESTAMP_PROPERTY_BYTES: usize = 35;

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Service-reported failure categories. Also the key of the per-reason
/// broker failure counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerErrorReason {
    ServiceBusy,
    ServiceTimeout,
    QuotaExceeded,
    MessageSizeExceeded,
    ResourceNotFound,
    Unauthorized,
    CommunicationProblem,
    Other,
}

impl BrokerErrorReason {
    pub const ALL: [BrokerErrorReason; 8] = [
        BrokerErrorReason::ServiceBusy,
        BrokerErrorReason::ServiceTimeout,
        BrokerErrorReason::QuotaExceeded,
        BrokerErrorReason::MessageSizeExceeded,
        BrokerErrorReason::ResourceNotFound,
        BrokerErrorReason::Unauthorized,
        BrokerErrorReason::CommunicationProblem,
        BrokerErrorReason::Other,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BrokerErrorReason::ServiceBusy => "service_busy",
            BrokerErrorReason::ServiceTimeout => "service_timeout",
            BrokerErrorReason::QuotaExceeded => "quota_exceeded",
            BrokerErrorReason::MessageSizeExceeded => "message_size_exceeded",
            BrokerErrorReason::ResourceNotFound => "resource_not_found",
            BrokerErrorReason::Unauthorized => "unauthorized",
            BrokerErrorReason::CommunicationProblem => "communication_problem",
            BrokerErrorReason::Other => "other",
        }
    }
}

impl fmt::Display for BrokerErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The operation observed its cancellation token.
    #[error("operation was canceled")]
    Canceled,
    /// The per-attempt send timeout elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker reported {reason}: {message}")]
    Broker {
        reason: BrokerErrorReason,
        message: String,
    },
    /// The handle is closed or corrupted and must be recreated.
    #[error("client faulted: {0}")]
    Faulted(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn broker(reason: BrokerErrorReason, message: impl Into<String>) -> Self {
        ClientError::Broker {
            reason,
            message: message.into(),
        }
    }

    /// Short, stable label for error records.
    pub fn kind(&self) -> String {
        match self {
            ClientError::Canceled => "canceled".to_string(),
            ClientError::Timeout(_) => "timeout".to_string(),
            ClientError::Broker { reason, .. } => format!("broker/{reason}"),
            ClientError::Faulted(_) => "faulted".to_string(),
            ClientError::Other(_) => "other".to_string(),
        }
    }
}

/// One synthetic message: an opaque body plus identity metadata.
#[derive(Debug, Clone)]
pub struct EventData {
    pub body: Vec<u8>,
    pub message_id: Uuid,
    /// Process-wide, never reused across client restarts.
    pub sequence: u64,
    /// Assigned at generation time, not at transmission time.
    pub published_at: DateTime<Utc>,
    pub publisher_id: Arc<str>,
}

impl EventData {
    pub const PROP_MESSAGE_ID: &'static str = "message_id";
    pub const PROP_SEQUENCE: &'static str = "sequence";
    pub const PROP_PUBLISHED_AT: &'static str = "published_at";
    pub const PROP_PUBLISHER_ID: &'static str = "publisher_id";

    /// Bytes this event occupies inside a batch.
    pub fn encoded_size(&self) -> usize {
        let properties = Self::PROP_MESSAGE_ID.len()
            + UUID_PROPERTY_BYTES
            + Self::PROP_SEQUENCE.len()
            + SEQUENCE_PROPERTY_BYTES
            + Self::PROP_PUBLISHED_AT.len()
            + TIMESTAMP_PROPERTY_BYTES
            + Self::PROP_PUBLISHER_ID.len()
            + self.publisher_id.len();
        EVENT_OVERHEAD_BYTES + properties + self.body.len()
    }
}

/// Bytes one event adds to a batch under some transport encoding.
pub type EventSizer = fn(&EventData) -> usize;

/// Size-bounded group of events submitted in one transmission.
pub struct EventBatch {
    max_size_bytes: usize,
    size_bytes: usize,
    sizer: EventSizer,
    events: Vec<EventData>,
}

impl EventBatch {
    pub fn new(max_size_bytes: usize) -> Self {
        Self::with_sizer(max_size_bytes, BATCH_OVERHEAD_BYTES, EventData::encoded_size)
    }

    /// A batch that accounts for events the way a transport encodes them,
    /// so `size_bytes` never understates what goes on the wire.
    pub fn with_sizer(max_size_bytes: usize, overhead_bytes: usize, sizer: EventSizer) -> Self {
        Self {
            max_size_bytes,
            size_bytes: overhead_bytes,
            sizer,
            events: Vec::new(),
        }
    }

    /// Add an event if it fits. A rejected event is dropped by the caller.
    pub fn try_add(&mut self, event: EventData) -> bool {
        let size = (self.sizer)(&event);
        if self.size_bytes.saturating_add(size) > self.max_size_bytes {
            return false;
        }
        self.size_bytes += size;
        self.events.push(event);
        true
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[EventData] {
        &self.events
    }
}

impl fmt::Debug for EventBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBatch")
            .field("max_size_bytes", &self.max_size_bytes)
            .field("size_bytes", &self.size_bytes)
            .field("events", &self.events.len())
            .finish()
    }
}

/// Everything needed to open a client handle.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub endpoint: String,
    pub entity: String,
    pub send_timeout: Duration,
    pub max_batch_bytes: usize,
    pub auth_token: Option<String>,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.target.endpoint.clone(),
            entity: config.target.entity.clone(),
            send_timeout: config.target.send_timeout(),
            max_batch_bytes: config.target.max_batch_bytes,
            auth_token: config.target.auth_token.clone(),
        }
    }
}

/// An open connection to the broker. Must tolerate concurrent `send` calls
/// from every active send loop.
pub trait ProducerClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_batch<'a>(&'a self) -> ClientFuture<'a, EventBatch>;

    fn send<'a>(&'a self, batch: EventBatch, cancel: &'a CancellationToken) -> ClientFuture<'a, ()>;

    /// Release all resources. Calling it twice is harmless.
    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Opens client handles; called once per generation.
pub trait ClientFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create<'a>(
        &'a self,
        settings: &'a ClientSettings,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, Arc<dyn ProducerClient>>;
}
