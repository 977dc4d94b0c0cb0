use super::{
    BrokerErrorReason, ClientError, ClientFactory, ClientFuture, ClientSettings, EventBatch,
    ProducerClient,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Scripted failures for the in-memory client. Send numbers are 1-based and
/// counted across every handle the factory has created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultPlan {
    /// The first N `create` calls fail.
    #[serde(default)]
    pub failed_creations: u64,
    /// Sends answered with a broker error.
    #[serde(default)]
    pub broker_faults_on_sends: Vec<u64>,
    /// Sends answered with a non-broker error.
    #[serde(default)]
    pub other_faults_on_sends: Vec<u64>,
    /// Sends that report an elapsed per-attempt timeout.
    #[serde(default)]
    pub timeouts_on_sends: Vec<u64>,
    /// The first N successfully created handles become faulted on their
    /// `fault_after_sends`-th send and stay faulted.
    #[serde(default)]
    pub faulted_handles: u64,
    #[serde(default)]
    pub fault_after_sends: u64,
    /// Simulated transmission time; honors cancellation.
    #[serde(default)]
    pub send_latency_ms: u64,
}

#[derive(Default)]
struct MockState {
    create_calls: AtomicU64,
    handles: AtomicU64,
    send_calls: AtomicU64,
    successful_sends: AtomicU64,
    events_received: AtomicU64,
    bytes_received: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight_at_dispose: AtomicU64,
    sends_after_dispose: AtomicU64,
    disposals: AtomicU64,
}

/// Counters observed by the mock broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockStats {
    pub create_calls: u64,
    pub handles: u64,
    pub send_calls: u64,
    pub successful_sends: u64,
    pub events_received: u64,
    pub bytes_received: u64,
    pub in_flight: u64,
    pub max_in_flight_at_dispose: u64,
    pub sends_after_dispose: u64,
    pub disposals: u64,
}

/// In-memory broker client (always accepts unless the plan says otherwise).
pub struct MockClientFactory {
    plan: Arc<FaultPlan>,
    state: Arc<MockState>,
}

impl MockClientFactory {
    pub fn new(plan: FaultPlan) -> Self {
        Self {
            plan: Arc::new(plan),
            state: Arc::new(MockState::default()),
        }
    }

    pub fn stats(&self) -> MockStats {
        let s = &self.state;
        MockStats {
            create_calls: s.create_calls.load(Ordering::SeqCst),
            handles: s.handles.load(Ordering::SeqCst),
            send_calls: s.send_calls.load(Ordering::SeqCst),
            successful_sends: s.successful_sends.load(Ordering::SeqCst),
            events_received: s.events_received.load(Ordering::SeqCst),
            bytes_received: s.bytes_received.load(Ordering::SeqCst),
            in_flight: s.in_flight.load(Ordering::SeqCst),
            max_in_flight_at_dispose: s.max_in_flight_at_dispose.load(Ordering::SeqCst),
            sends_after_dispose: s.sends_after_dispose.load(Ordering::SeqCst),
            disposals: s.disposals.load(Ordering::SeqCst),
        }
    }
}

impl ClientFactory for MockClientFactory {
    fn name(&self) -> &'static str {
        "mock"
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
            let call = self.state.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            if call <= self.plan.failed_creations {
                return Err(anyhow::anyhow!("injected client creation failure #{call}").into());
            }

            let generation = self.state.handles.fetch_add(1, Ordering::SeqCst) + 1;
            let fault_on_send =
                (generation <= self.plan.faulted_handles).then(|| self.plan.fault_after_sends.max(1));

            let client: Arc<dyn ProducerClient> = Arc::new(MockClient {
                generation,
                max_batch_bytes: settings.max_batch_bytes,
                send_timeout: settings.send_timeout,
                plan: self.plan.clone(),
                state: self.state.clone(),
                handle_sends: AtomicU64::new(0),
                fault_on_send,
                poisoned: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            });
            Ok(client)
        })
    }
}

pub struct MockClient {
    generation: u64,
    max_batch_bytes: usize,
    send_timeout: Duration,
    plan: Arc<FaultPlan>,
    state: Arc<MockState>,
    handle_sends: AtomicU64,
    fault_on_send: Option<u64>,
    poisoned: AtomicBool,
    disposed: AtomicBool,
}

struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockClient {
    async fn transmit(
        &self,
        call: u64,
        batch: EventBatch,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        // Zero-latency sends complete before they can observe cancellation.
        if self.plan.send_latency_ms > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Canceled),
                _ = sleep(Duration::from_millis(self.plan.send_latency_ms)) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }

        if self.poisoned.load(Ordering::SeqCst) {
            return Err(ClientError::Faulted(format!(
                "mock handle {} is faulted",
                self.generation
            )));
        }
        let handle_send = self.handle_sends.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(fault_on) = self.fault_on_send {
            if handle_send >= fault_on {
                self.poisoned.store(true, Ordering::SeqCst);
                return Err(ClientError::Faulted(format!(
                    "injected fault on mock handle {}",
                    self.generation
                )));
            }
        }

        if self.plan.broker_faults_on_sends.contains(&call) {
            return Err(ClientError::broker(
                BrokerErrorReason::ServiceBusy,
                format!("injected broker fault on send {call}"),
            ));
        }
        if self.plan.timeouts_on_sends.contains(&call) {
            return Err(ClientError::Timeout(self.send_timeout));
        }
        if self.plan.other_faults_on_sends.contains(&call) {
            return Err(anyhow::anyhow!("injected failure on send {call}").into());
        }

        self.state.successful_sends.fetch_add(1, Ordering::SeqCst);
        self.state
            .events_received
            .fetch_add(batch.len() as u64, Ordering::SeqCst);
        self.state
            .bytes_received
            .fetch_add(batch.size_bytes() as u64, Ordering::SeqCst);
        Ok(())
    }
}

impl ProducerClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_batch<'a>(&'a self) -> ClientFuture<'a, EventBatch> {
        Box::pin(async move {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(ClientError::Faulted("mock client is disposed".to_string()));
            }
            Ok(EventBatch::new(self.max_batch_bytes))
        })
    }

    fn send<'a>(&'a self, batch: EventBatch, cancel: &'a CancellationToken) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let call = self.state.send_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.disposed.load(Ordering::SeqCst) {
                self.state.sends_after_dispose.fetch_add(1, Ordering::SeqCst);
                return Err(ClientError::Faulted("mock client is disposed".to_string()));
            }
            let _in_flight = InFlight::enter(&self.state.in_flight);
            self.transmit(call, batch, cancel).await
        })
    }

    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            let in_flight = self.state.in_flight.load(Ordering::SeqCst);
            self.state
                .max_in_flight_at_dispose
                .fetch_max(in_flight, Ordering::SeqCst);
            self.state.disposals.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ClientSettings {
        ClientSettings {
            endpoint: "http://localhost:8080".to_string(),
            entity: "stress".to_string(),
            send_timeout: Duration::from_secs(1),
            max_batch_bytes: 4_096,
            auth_token: None,
        }
    }

    #[tokio::test]
    async fn test_failed_creations_then_success() {
        let factory = MockClientFactory::new(FaultPlan {
            failed_creations: 2,
            ..Default::default()
        });
        let settings = settings();
        let cancel = CancellationToken::new();

        assert!(factory.create(&settings, &cancel).await.is_err());
        assert!(factory.create(&settings, &cancel).await.is_err());
        assert!(factory.create(&settings, &cancel).await.is_ok());

        let stats = factory.stats();
        assert_eq!(stats.create_calls, 3);
        assert_eq!(stats.handles, 1);
    }

    #[tokio::test]
    async fn test_scripted_send_faults() {
        let factory = MockClientFactory::new(FaultPlan {
            broker_faults_on_sends: vec![2],
            timeouts_on_sends: vec![3],
            ..Default::default()
        });
        let settings = settings();
        let cancel = CancellationToken::new();
        let client = factory.create(&settings, &cancel).await.unwrap();

        let batch = client.create_batch().await.unwrap();
        assert_eq!(batch.max_size_bytes(), 4_096);
        assert!(client.send(batch, &cancel).await.is_ok());

        let batch = client.create_batch().await.unwrap();
        assert!(matches!(
            client.send(batch, &cancel).await,
            Err(ClientError::Broker { reason: BrokerErrorReason::ServiceBusy, .. })
        ));

        let batch = client.create_batch().await.unwrap();
        assert!(matches!(client.send(batch, &cancel).await, Err(ClientError::Timeout(_))));

        assert_eq!(factory.stats().successful_sends, 1);
    }

    #[tokio::test]
    async fn test_faulted_handle_stays_faulted() {
        let factory = MockClientFactory::new(FaultPlan {
            faulted_handles: 1,
            fault_after_sends: 2,
            ..Default::default()
        });
        let settings = settings();
        let cancel = CancellationToken::new();
        let client = factory.create(&settings, &cancel).await.unwrap();

        let batch = client.create_batch().await.unwrap();
        assert!(client.send(batch, &cancel).await.is_ok());
        for _ in 0..3 {
            let batch = client.create_batch().await.unwrap();
            assert!(matches!(client.send(batch, &cancel).await, Err(ClientError::Faulted(_))));
        }

        // The next handle is healthy.
        let client = factory.create(&settings, &cancel).await.unwrap();
        let batch = client.create_batch().await.unwrap();
        assert!(client.send(batch, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_observes_cancellation() {
        let factory = MockClientFactory::new(FaultPlan {
            send_latency_ms: 10_000,
            ..Default::default()
        });
        let settings = settings();
        let cancel = CancellationToken::new();
        let client = factory.create(&settings, &cancel).await.unwrap();

        let batch = client.create_batch().await.unwrap();
        let send_cancel = CancellationToken::new();
        let canceller = send_cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        assert!(matches!(client.send(batch, &send_cancel).await, Err(ClientError::Canceled)));
        assert_eq!(factory.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_closes_handle() {
        let factory = MockClientFactory::new(FaultPlan::default());
        let settings = settings();
        let cancel = CancellationToken::new();
        let client = factory.create(&settings, &cancel).await.unwrap();

        client.dispose().await;
        client.dispose().await;
        assert_eq!(factory.stats().disposals, 1);

        assert!(matches!(client.create_batch().await, Err(ClientError::Faulted(_))));
        assert!(matches!(
            client.send(EventBatch::new(1_024), &cancel).await,
            Err(ClientError::Faulted(_))
        ));
        assert_eq!(factory.stats().sends_after_dispose, 1);
    }
}
