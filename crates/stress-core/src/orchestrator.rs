//! Client lifecycle and concurrent send fan-out.
//!
//! Each generation owns one client handle shared by `concurrent_sends` send
//! loops: `concurrent_sends - 1` background loops on the runtime and one
//! foreground loop on the caller's task. Background loops run under a scope
//! derived from the overall cancellation token, so they can be stopped on
//! their own. No loop outlives the handle: the scope is cancelled and every
//! background loop awaited before the handle is disposed.

use crate::client::{ClientError, ClientFactory, ClientSettings, ProducerClient};
use crate::config::Config;
use crate::errors::{ErrorCategory, ErrorCollector, ErrorRecord};
use crate::metrics::MetricsSink;
use crate::payload::RandomPayloadGenerator;
use crate::sender::{BatchSendWorker, SendOutcome};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PublishOrchestrator {
    config: Config,
    settings: ClientSettings,
    factory: Arc<dyn ClientFactory>,
    metrics: Arc<MetricsSink>,
    errors: Arc<ErrorCollector>,
    publisher_id: Arc<str>,
    sequence: Arc<AtomicU64>,
    seeds: AtomicU64,
    generations: AtomicU64,
    background_senders: Arc<AtomicUsize>,
}

impl PublishOrchestrator {
    pub fn new(
        config: Config,
        factory: Arc<dyn ClientFactory>,
        metrics: Arc<MetricsSink>,
        errors: Arc<ErrorCollector>,
    ) -> Self {
        Self {
            settings: ClientSettings::from_config(&config),
            publisher_id: Arc::from(config.worker.id.as_str()),
            seeds: AtomicU64::new(config.publish.seed),
            config,
            factory,
            metrics,
            errors,
            sequence: Arc::new(AtomicU64::new(0)),
            generations: AtomicU64::new(0),
            background_senders: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Next sequence number to be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Client generations started so far, including failed creations.
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::Relaxed)
    }

    /// Background send loops currently running.
    pub fn active_background_senders(&self) -> usize {
        self.background_senders.load(Ordering::SeqCst)
    }

    /// Publish until `cancel` fires. Client faults never escape: they are
    /// recorded, counted as a restart, and a new client is created.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(
            "Publishing to '{}' via {} with {} concurrent sends",
            self.settings.entity,
            self.factory.name(),
            self.config.publish.concurrent_sends
        );

        while !cancel.is_cancelled() {
            let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

            if let Err(fault) = self.run_generation(generation, &cancel).await {
                self.metrics.record_restart();
                warn!(
                    generation,
                    restarts = self.metrics.producer_restarts(),
                    "Client faulted, restarting: {}",
                    fault
                );
                self.errors.push(ErrorRecord::new(
                    ErrorCategory::ClientFault,
                    fault.kind(),
                    fault.to_string(),
                    generation,
                ));
                self.restart_backoff(&cancel).await;
            }
        }

        info!(
            "Publisher stopped after {} generation(s)",
            self.generations()
        );
    }

    /// One client lifetime. `Ok` means overall shutdown, `Err` a fault.
    async fn run_generation(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let client = match self.factory.create(&self.settings, cancel).await {
            Ok(client) => client,
            Err(ClientError::Canceled) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };
        info!(generation, client = client.name(), "Client created");

        let mut background = BackgroundSenders::new(cancel, self.background_senders.clone());
        self.spawn_background(&mut background, generation, &client);

        let result = self
            .run_foreground(generation, &client, cancel, &mut background)
            .await;

        if let Some(fault) = background.drain().await {
            debug!(generation, "Background sender stopped with: {}", fault);
        }
        client.dispose().await;
        debug!(generation, "Client disposed");
        result
    }

    async fn run_foreground(
        &self,
        generation: u64,
        client: &Arc<dyn ProducerClient>,
        cancel: &CancellationToken,
        background: &mut BackgroundSenders,
    ) -> Result<(), ClientError> {
        let mut worker = self.new_worker(generation);
        let delay = self.config.publish.publishing_delay();

        while !cancel.is_cancelled() {
            let outcome = tokio::select! {
                biased;
                fault = background.next_fault() => return Err(fault),
                outcome = worker.perform_send(client.as_ref(), cancel) => outcome,
            };

            match outcome {
                SendOutcome::HandleFaulted(fault) => return Err(fault),
                SendOutcome::TimedOut if !cancel.is_cancelled() => {
                    // Background loops stay stopped for the rest of this
                    // generation unless re-arming is enabled.
                    if background.is_running() {
                        warn!(generation, "Foreground send timed out, draining background senders");
                        if let Some(fault) = background.drain().await {
                            return Err(fault);
                        }
                        if self.config.publish.rearm_background_after_timeout
                            && !cancel.is_cancelled()
                        {
                            background.rearm(cancel);
                            self.spawn_background(background, generation, client);
                        }
                    }
                }
                _ => {}
            }

            if !pause(delay, cancel).await {
                break;
            }
        }
        Ok(())
    }

    fn spawn_background(
        &self,
        background: &mut BackgroundSenders,
        generation: u64,
        client: &Arc<dyn ProducerClient>,
    ) {
        let delay = self.config.publish.publishing_delay();
        for _ in 1..self.config.publish.concurrent_sends {
            background.spawn(client.clone(), self.new_worker(generation), delay);
        }
    }

    fn new_worker(&self, generation: u64) -> BatchSendWorker {
        let seed = self.seeds.fetch_add(1, Ordering::Relaxed);
        let generator = RandomPayloadGenerator::new(
            &self.config.publish,
            self.publisher_id.clone(),
            self.sequence.clone(),
            seed,
        );
        BatchSendWorker::new(
            generator,
            self.config.publish.batch_fill_size,
            self.metrics.clone(),
            self.errors.clone(),
            generation,
        )
    }

    async fn restart_backoff(&self, cancel: &CancellationToken) {
        let backoff = Duration::from_millis(self.config.run.restart_backoff_ms);
        if backoff.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(backoff) => {}
        }
    }
}

/// Sleep the inter-publish delay, or just yield when there is none.
/// Returns `false` once `cancel` has fired.
async fn pause(delay: Option<Duration>, cancel: &CancellationToken) -> bool {
    match delay {
        Some(delay) => tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        },
        None => {
            tokio::task::yield_now().await;
            !cancel.is_cancelled()
        }
    }
}

/// The background send loops of one generation and the scope that stops
/// them.
struct BackgroundSenders {
    scope: CancellationToken,
    tasks: JoinSet<Result<(), ClientError>>,
    active: Arc<AtomicUsize>,
}

impl BackgroundSenders {
    fn new(parent: &CancellationToken, active: Arc<AtomicUsize>) -> Self {
        Self {
            scope: parent.child_token(),
            tasks: JoinSet::new(),
            active,
        }
    }

    fn is_running(&self) -> bool {
        !self.tasks.is_empty() && !self.scope.is_cancelled()
    }

    fn spawn(
        &mut self,
        client: Arc<dyn ProducerClient>,
        worker: BatchSendWorker,
        delay: Option<Duration>,
    ) {
        let scope = self.scope.clone();
        let active = ActiveSender::enter(self.active.clone());
        self.tasks
            .spawn(background_loop(client, worker, scope, delay, active));
    }

    /// Resolves with the first handle fault (or panic) from a background
    /// loop. Pending forever while no loop has failed.
    async fn next_fault(&mut self) -> ClientError {
        loop {
            match self.tasks.join_next().await {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(fault))) => return fault,
                Some(Err(e)) => return loop_failure(e),
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Cancel the scope and wait for every loop. Returns the first fault a
    /// loop reported on its way out; later ones are only logged.
    async fn drain(&mut self) -> Option<ClientError> {
        self.scope.cancel();
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            let fault = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(fault)) => fault,
                Err(e) => loop_failure(e),
            };
            if first.is_none() {
                first = Some(fault);
            } else {
                debug!("Background sender stopped with: {}", fault);
            }
        }
        first
    }

    /// Fresh scope after a drain.
    fn rearm(&mut self, parent: &CancellationToken) {
        self.scope = parent.child_token();
    }
}

fn loop_failure(e: JoinError) -> ClientError {
    anyhow::anyhow!("background send loop failed: {e}").into()
}

/// Keeps the active-background-sender gauge in step with loop lifetimes.
struct ActiveSender(Arc<AtomicUsize>);

impl ActiveSender {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveSender {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn background_loop(
    client: Arc<dyn ProducerClient>,
    mut worker: BatchSendWorker,
    scope: CancellationToken,
    delay: Option<Duration>,
    _active: ActiveSender,
) -> Result<(), ClientError> {
    while !scope.is_cancelled() {
        if let SendOutcome::HandleFaulted(fault) = worker.perform_send(client.as_ref(), &scope).await
        {
            return Err(fault);
        }
        if !pause(delay, &scope).await {
            break;
        }
    }
    Ok(())
}
