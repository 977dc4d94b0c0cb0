use crate::client::{ClientError, ProducerClient};
use crate::errors::{ErrorCategory, ErrorCollector, ErrorRecord};
use crate::metrics::MetricsSink;
use crate::payload::RandomPayloadGenerator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What one build-fill-send cycle did. Metrics and the error collector are
/// already updated by the time this is returned.
#[derive(Debug)]
pub enum SendOutcome {
    Published { events: u64, bytes: u64 },
    /// Every generated message was too large for the batch; nothing sent.
    Empty,
    Failed(ErrorCategory),
    /// The per-attempt send timeout elapsed. Counted as a canceled send.
    TimedOut,
    /// The client handle is unusable. Not recorded here; the generation owner
    /// records it when it restarts the client.
    HandleFaulted(ClientError),
}

/// Builds a batch, fills it with generated messages and sends it, absorbing
/// every failure into metrics and the error collector.
pub struct BatchSendWorker {
    generator: RandomPayloadGenerator,
    batch_fill_size: usize,
    metrics: Arc<MetricsSink>,
    errors: Arc<ErrorCollector>,
    generation: u64,
}

impl BatchSendWorker {
    pub fn new(
        generator: RandomPayloadGenerator,
        batch_fill_size: usize,
        metrics: Arc<MetricsSink>,
        errors: Arc<ErrorCollector>,
        generation: u64,
    ) -> Self {
        Self {
            generator,
            batch_fill_size,
            metrics,
            errors,
            generation,
        }
    }

    pub async fn perform_send(
        &mut self,
        client: &dyn ProducerClient,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let mut batch = match client.create_batch().await {
            Ok(batch) => batch,
            Err(e) => return self.classify(e),
        };

        let max_item_bytes = batch.max_size_bytes();
        let mut dropped = 0usize;
        for _ in 0..self.batch_fill_size {
            // Rejected messages are dropped, never retried.
            if !batch.try_add(self.generator.generate(max_item_bytes)) {
                dropped += 1;
            }
        }

        if batch.is_empty() {
            debug!("All {} generated messages exceeded the batch size", dropped);
            return SendOutcome::Empty;
        }

        let events = batch.len() as u64;
        let bytes = batch.size_bytes() as u64;
        match client.send(batch, cancel).await {
            Ok(()) => {
                self.metrics.record_published(events, bytes);
                SendOutcome::Published { events, bytes }
            }
            Err(e) => self.classify(e),
        }
    }

    fn classify(&self, error: ClientError) -> SendOutcome {
        let (category, outcome) = match error {
            ClientError::Faulted(_) => return SendOutcome::HandleFaulted(error),
            ClientError::Canceled => {
                self.metrics.record_canceled_send();
                (
                    ErrorCategory::CanceledSend,
                    SendOutcome::Failed(ErrorCategory::CanceledSend),
                )
            }
            ClientError::Timeout(_) => {
                self.metrics.record_canceled_send();
                (ErrorCategory::CanceledSend, SendOutcome::TimedOut)
            }
            ClientError::Broker { reason, .. } => {
                self.metrics.record_broker_failure(reason);
                (
                    ErrorCategory::BrokerSend,
                    SendOutcome::Failed(ErrorCategory::BrokerSend),
                )
            }
            ClientError::Other(_) => {
                self.metrics.record_general_failure();
                (
                    ErrorCategory::GeneralSend,
                    SendOutcome::Failed(ErrorCategory::GeneralSend),
                )
            }
        };

        debug!(generation = self.generation, "Send failed: {}", error);
        self.errors.push(ErrorRecord::new(
            category,
            error.kind(),
            error.to_string(),
            self.generation,
        ));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientFactory, ClientSettings, FaultPlan, MockClientFactory};
    use crate::config::PublishConfig;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    const MIN_BYTES: usize = 100;

    struct Harness {
        factory: MockClientFactory,
        client: Arc<dyn ProducerClient>,
        worker: BatchSendWorker,
        metrics: Arc<MetricsSink>,
        errors: Arc<ErrorCollector>,
    }

    async fn harness(plan: FaultPlan, max_batch_bytes: usize, large_message_factor: f64) -> Harness {
        let publish = PublishConfig {
            concurrent_sends: 1,
            publishing_delay_ms: None,
            batch_fill_size: 10,
            min_bytes: MIN_BYTES,
            regular_max_bytes: 200,
            large_message_factor,
            seed: 11,
            rearm_background_after_timeout: false,
        };
        let settings = ClientSettings {
            endpoint: "http://localhost:8080".to_string(),
            entity: "stress".to_string(),
            send_timeout: Duration::from_secs(1),
            max_batch_bytes,
            auth_token: None,
        };

        let factory = MockClientFactory::new(plan);
        let client = factory
            .create(&settings, &CancellationToken::new())
            .await
            .unwrap();
        let metrics = Arc::new(MetricsSink::new());
        let errors = Arc::new(ErrorCollector::new());
        let generator = RandomPayloadGenerator::new(
            &publish,
            Arc::from("test"),
            Arc::new(AtomicU64::new(0)),
            publish.seed,
        );
        let worker = BatchSendWorker::new(
            generator,
            publish.batch_fill_size,
            metrics.clone(),
            errors.clone(),
            1,
        );

        Harness {
            factory,
            client,
            worker,
            metrics,
            errors,
        }
    }

    #[tokio::test]
    async fn test_successful_send_updates_metrics() {
        let mut h = harness(FaultPlan::default(), 1_048_576, 0.0).await;
        let cancel = CancellationToken::new();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        let (events, bytes) = match outcome {
            SendOutcome::Published { events, bytes } => (events, bytes),
            other => panic!("unexpected outcome: {:?}", other),
        };

        assert_eq!(events, 10);
        assert_eq!(h.metrics.events_published(), events);
        assert_eq!(h.metrics.published_bytes(), bytes);
        assert_eq!(h.metrics.batches_published(), 1);
        assert_eq!(h.metrics.total_service_operations(), 1);
        assert!(h.metrics.published_bytes() >= h.metrics.events_published() * MIN_BYTES as u64);

        let stats = h.factory.stats();
        assert_eq!(stats.events_received, events);
        assert_eq!(stats.bytes_received, bytes);
        assert!(h.errors.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_a_send() {
        // Smaller than any single generated message.
        let mut h = harness(FaultPlan::default(), 64, 0.0).await;
        let cancel = CancellationToken::new();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        assert!(matches!(outcome, SendOutcome::Empty));

        assert_eq!(h.factory.stats().send_calls, 0);
        assert_eq!(h.metrics.total_service_operations(), 0);
        assert_eq!(h.metrics.total_exceptions(), 0);
        assert!(h.errors.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_messages_are_dropped() {
        let mut h = harness(FaultPlan::default(), 4_096, 1.0).await;
        let cancel = CancellationToken::new();

        for _ in 0..20 {
            h.worker.perform_send(h.client.as_ref(), &cancel).await;
        }

        let stats = h.factory.stats();
        assert_eq!(h.metrics.events_published(), stats.events_received);
        assert_eq!(h.metrics.published_bytes(), stats.bytes_received);
        assert!(h.metrics.events_published() < 20 * 10);
        assert_eq!(h.metrics.total_exceptions(), 0);
    }

    #[tokio::test]
    async fn test_broker_fault_is_recorded() {
        let plan = FaultPlan {
            broker_faults_on_sends: vec![1],
            ..Default::default()
        };
        let mut h = harness(plan, 1_048_576, 0.0).await;
        let cancel = CancellationToken::new();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        assert!(matches!(outcome, SendOutcome::Failed(ErrorCategory::BrokerSend)));

        assert_eq!(h.metrics.total_exceptions(), 1);
        assert_eq!(h.metrics.send_exceptions(), 1);
        assert_eq!(h.metrics.general_exceptions(), 0);
        assert_eq!(h.metrics.canceled_send_exceptions(), 0);
        assert_eq!(
            h.metrics
                .broker_failures(crate::client::BrokerErrorReason::ServiceBusy),
            1
        );
        assert_eq!(h.metrics.events_published(), 0);

        let records = h.errors.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, ErrorCategory::BrokerSend);
        assert_eq!(records[0].kind, "broker/service_busy");
        assert_eq!(records[0].generation, 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_counted_separately() {
        let plan = FaultPlan {
            send_latency_ms: 10_000,
            ..Default::default()
        };
        let mut h = harness(plan, 1_048_576, 0.0).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        assert!(matches!(outcome, SendOutcome::Failed(ErrorCategory::CanceledSend)));

        assert_eq!(h.metrics.total_exceptions(), 1);
        assert_eq!(h.metrics.send_exceptions(), 1);
        assert_eq!(h.metrics.canceled_send_exceptions(), 1);
        assert_eq!(h.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_timed_out() {
        let plan = FaultPlan {
            timeouts_on_sends: vec![1],
            ..Default::default()
        };
        let mut h = harness(plan, 1_048_576, 0.0).await;
        let cancel = CancellationToken::new();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        assert!(matches!(outcome, SendOutcome::TimedOut));
        assert_eq!(h.metrics.canceled_send_exceptions(), 1);
        assert_eq!(h.errors.drain()[0].kind, "timeout");
    }

    #[tokio::test]
    async fn test_other_failure_is_general() {
        let plan = FaultPlan {
            other_faults_on_sends: vec![1],
            ..Default::default()
        };
        let mut h = harness(plan, 1_048_576, 0.0).await;
        let cancel = CancellationToken::new();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        assert!(matches!(outcome, SendOutcome::Failed(ErrorCategory::GeneralSend)));
        assert_eq!(h.metrics.general_exceptions(), 1);
        assert_eq!(h.metrics.send_exceptions(), 1);
        assert_eq!(h.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_fault_is_left_to_caller() {
        let plan = FaultPlan {
            faulted_handles: 1,
            fault_after_sends: 1,
            ..Default::default()
        };
        let mut h = harness(plan, 1_048_576, 0.0).await;
        let cancel = CancellationToken::new();

        let outcome = h.worker.perform_send(h.client.as_ref(), &cancel).await;
        assert!(matches!(outcome, SendOutcome::HandleFaulted(ClientError::Faulted(_))));
        assert_eq!(h.metrics.total_exceptions(), 0);
        assert!(h.errors.is_empty());
    }
}
