use super::{
    BrokerErrorReason, ClientError, ClientFactory, ClientFuture, ClientSettings, EventBatch,
    EventData, ProducerClient, TIMESTAMP_PROPERTY_BYTES, UUID_PROPERTY_BYTES,
};
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.servicebus.json";

/// Longest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 256;

/// `[` and `]` around the event array.
const WIRE_ARRAY_BYTES: usize = 2;
/// Keys, quotes and braces of one [`WireEvent`] plus its separating comma.
const WIRE_EVENT_FRAMING_BYTES: usize = 93;

/// Opens [`HttpBatchClient`] handles.
#[derive(Debug, Default)]
pub struct HttpClientFactory;

impl HttpClientFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ClientFactory for HttpClientFactory {
    fn name(&self) -> &'static str {
        "http"
    }

    fn create<'a>(
        &'a self,
        settings: &'a ClientSettings,
        cancel: &'a CancellationToken,
    ) -> ClientFuture<'a, Arc<dyn ProducerClient>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(ClientError::Canceled);
            }
            let client: Arc<dyn ProducerClient> = Arc::new(HttpBatchClient::new(settings)?);
            Ok(client)
        })
    }
}

/// Publishes batches as a JSON array to `{endpoint}/{entity}/messages`.
pub struct HttpBatchClient {
    client: reqwest::Client,
    send_url: url::Url,
    auth_token: Option<String>,
    timeout: Duration,
    max_batch_bytes: usize,
    closed: AtomicBool,
}

#[derive(Debug, Serialize)]
struct WireEvent {
    #[serde(rename = "Body")]
    body: String,
    #[serde(rename = "UserProperties")]
    user_properties: WireProperties,
}

#[derive(Debug, Serialize)]
struct WireProperties {
    message_id: String,
    sequence: u64,
    published_at: String,
    publisher_id: String,
}

impl From<&EventData> for WireEvent {
    fn from(event: &EventData) -> Self {
        Self {
            body: BASE64.encode(&event.body),
            user_properties: WireProperties {
                message_id: event.message_id.to_string(),
                sequence: event.sequence,
                published_at: event.published_at.to_rfc3339(),
                publisher_id: event.publisher_id.to_string(),
            },
        }
    }
}

impl HttpBatchClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(settings.send_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            send_url: build_send_url(&settings.endpoint, &settings.entity)?,
            auth_token: settings.auth_token.clone(),
            timeout: settings.send_timeout,
            max_batch_bytes: settings.max_batch_bytes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn send_url(&self) -> &url::Url {
        &self.send_url
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Faulted("HTTP client is disposed".to_string()));
        }
        Ok(())
    }
}

/// JSON bytes `event` adds to a request body. Never less than what
/// `serde_json` writes for it, counting one comma per event.
fn wire_size(event: &EventData) -> usize {
    let body = base64::encoded_len(event.body.len(), true).unwrap_or(usize::MAX);
    let sequence = event.sequence.checked_ilog10().map_or(1, |d| d as usize + 1);
    let publisher_id = serde_json::to_string(event.publisher_id.as_ref())
        .map_or(usize::MAX, |quoted| quoted.len());
    WIRE_EVENT_FRAMING_BYTES
        .saturating_add(body)
        .saturating_add(UUID_PROPERTY_BYTES)
        .saturating_add(sequence)
        .saturating_add(TIMESTAMP_PROPERTY_BYTES)
        .saturating_add(publisher_id)
}

fn build_send_url(endpoint: &str, entity: &str) -> anyhow::Result<url::Url> {
    let mut base =
        url::Url::parse(endpoint).with_context(|| format!("Invalid endpoint URL: {endpoint}"))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let entity = entity.trim_matches('/');
    base.join(&format!("{entity}/messages"))
        .with_context(|| format!("Invalid entity name: {entity}"))
}

/// Broker reason for a non-success status, `None` for 2xx.
fn reason_for_status(status: StatusCode) -> Option<BrokerErrorReason> {
    if status.is_success() {
        return None;
    }
    let reason = match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            BrokerErrorReason::ServiceBusy
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BrokerErrorReason::ServiceTimeout
        }
        StatusCode::PAYLOAD_TOO_LARGE => BrokerErrorReason::MessageSizeExceeded,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerErrorReason::Unauthorized,
        StatusCode::NOT_FOUND => BrokerErrorReason::ResourceNotFound,
        StatusCode::INSUFFICIENT_STORAGE => BrokerErrorReason::QuotaExceeded,
        StatusCode::BAD_GATEWAY => BrokerErrorReason::CommunicationProblem,
        _ => BrokerErrorReason::Other,
    };
    Some(reason)
}

impl ProducerClient for HttpBatchClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn create_batch<'a>(&'a self) -> ClientFuture<'a, EventBatch> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(EventBatch::with_sizer(
                self.max_batch_bytes,
                WIRE_ARRAY_BYTES,
                wire_size,
            ))
        })
    }

    fn send<'a>(&'a self, batch: EventBatch, cancel: &'a CancellationToken) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;

            let wire: Vec<WireEvent> = batch.events().iter().map(WireEvent::from).collect();
            let body = serde_json::to_vec(&wire).context("Failed to encode batch")?;

            let mut request = self
                .client
                .post(self.send_url.clone())
                .header(CONTENT_TYPE, BATCH_CONTENT_TYPE)
                .body(body);
            if let Some(token) = &self.auth_token {
                request = request.bearer_auth(token);
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Canceled),
                response = request.send() => response,
            };

            match response {
                Ok(response) => {
                    let status = response.status();
                    let Some(reason) = reason_for_status(status) else {
                        return Ok(());
                    };
                    let text: String = response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(MAX_ERROR_BODY)
                        .collect();
                    debug!("Send rejected: status={} reason={}", status, reason);
                    Err(ClientError::broker(reason, format!("HTTP {status}: {text}")))
                }
                Err(e) if e.is_timeout() => Err(ClientError::Timeout(self.timeout)),
                Err(e) if e.is_connect() => Err(ClientError::broker(
                    BrokerErrorReason::CommunicationProblem,
                    e.to_string(),
                )),
                Err(e) => Err(anyhow::Error::from(e).into()),
            }
        })
    }

    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn event(body_len: usize, sequence: u64) -> EventData {
        EventData {
            body: vec![0xAB; body_len],
            message_id: Uuid::new_v4(),
            sequence,
            published_at: Utc::now(),
            publisher_id: Arc::from("publisher-0"),
        }
    }

    fn settings(endpoint: &str) -> ClientSettings {
        ClientSettings {
            endpoint: endpoint.to_string(),
            entity: "stress".to_string(),
            send_timeout: Duration::from_secs(1),
            max_batch_bytes: 2_048,
            auth_token: None,
        }
    }

    #[test]
    fn test_send_url_joins_entity() {
        let url = build_send_url("http://localhost:8080", "stress").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/stress/messages");

        let url = build_send_url("https://broker.example/ns", "/hub/").unwrap();
        assert_eq!(url.as_str(), "https://broker.example/ns/hub/messages");

        assert!(build_send_url("not a url", "stress").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(reason_for_status(StatusCode::CREATED), None);
        assert_eq!(
            reason_for_status(StatusCode::TOO_MANY_REQUESTS),
            Some(BrokerErrorReason::ServiceBusy)
        );
        assert_eq!(
            reason_for_status(StatusCode::GATEWAY_TIMEOUT),
            Some(BrokerErrorReason::ServiceTimeout)
        );
        assert_eq!(
            reason_for_status(StatusCode::PAYLOAD_TOO_LARGE),
            Some(BrokerErrorReason::MessageSizeExceeded)
        );
        assert_eq!(
            reason_for_status(StatusCode::FORBIDDEN),
            Some(BrokerErrorReason::Unauthorized)
        );
        assert_eq!(
            reason_for_status(StatusCode::IM_A_TEAPOT),
            Some(BrokerErrorReason::Other)
        );
    }

    #[test]
    fn test_wire_event_encoding() {
        let event = EventData {
            body: vec![1, 2, 3],
            message_id: Uuid::nil(),
            sequence: 7,
            published_at: Utc::now(),
            publisher_id: Arc::from("publisher-0"),
        };

        let json = serde_json::to_value(WireEvent::from(&event)).unwrap();
        assert_eq!(json["Body"], "AQID");
        assert_eq!(json["UserProperties"]["sequence"], 7);
        assert_eq!(json["UserProperties"]["publisher_id"], "publisher-0");
    }

    #[test]
    fn test_wire_size_matches_encoding() {
        let mut event = event(301, 12_345);
        event.published_at = Utc
            .timestamp_opt(1_700_000_000, 123_456_789)
            .single()
            .unwrap();
        let json = serde_json::to_vec(&WireEvent::from(&event)).unwrap();
        assert_eq!(wire_size(&event), json.len() + 1);

        // Shorter timestamps and ids only ever shrink the real encoding.
        let mut quoted = event.clone();
        quoted.published_at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        quoted.publisher_id = Arc::from("pub\"lisher");
        let json = serde_json::to_vec(&WireEvent::from(&quoted)).unwrap();
        assert!(wire_size(&quoted) > json.len());
    }

    #[tokio::test]
    async fn test_full_batch_fits_wire_limit() {
        let client = HttpBatchClient::new(&settings("http://127.0.0.1:9")).unwrap();
        let mut batch = client.create_batch().await.unwrap();

        let mut sequence = 0;
        while batch.try_add(event(300, sequence)) {
            sequence += 1;
        }
        assert!(batch.len() >= 2);

        let wire: Vec<WireEvent> = batch.events().iter().map(WireEvent::from).collect();
        let body = serde_json::to_vec(&wire).unwrap();
        assert!(body.len() <= batch.size_bytes());
        assert!(batch.size_bytes() <= batch.max_size_bytes());
    }

    #[tokio::test]
    async fn test_disposed_client_is_faulted() {
        let client = HttpBatchClient::new(&settings("http://127.0.0.1:9")).unwrap();
        let batch = client.create_batch().await.unwrap();
        assert_eq!(batch.max_size_bytes(), 2_048);

        client.dispose().await;
        let cancel = CancellationToken::new();
        assert!(matches!(client.create_batch().await, Err(ClientError::Faulted(_))));
        assert!(matches!(client.send(batch, &cancel).await, Err(ClientError::Faulted(_))));
    }

    #[tokio::test]
    async fn test_factory_rejects_bad_endpoint() {
        let factory = HttpClientFactory::new();
        let cancel = CancellationToken::new();
        let settings = settings("::not-a-url::");
        assert!(matches!(
            factory.create(&settings, &cancel).await,
            Err(ClientError::Other(_))
        ));
    }
}
