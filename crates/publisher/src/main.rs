use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stress_core::{
    ClientFactory, Config, ErrorCollector, HttpClientFactory, MetricsSink, MetricsSnapshot,
    MockClientFactory, PublishOrchestrator,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error records logged per progress tick; the rest are only counted.
const MAX_LOGGED_ERRORS_PER_TICK: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Sustained-load publisher - generates, batches and sends synthetic messages")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Client mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Publisher ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Stop after N milliseconds (overrides config)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Print stats every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PublisherResult {
    publisher_id: String,
    timestamp: String,
    mode: String,
    entity: String,
    generations: u64,
    next_sequence: u64,
    metrics: MetricsSnapshot,
    error_kinds: BTreeMap<String, u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(worker_id) = args.worker_id.clone() {
        config.worker.id = worker_id;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.run.duration_ms = Some(duration_ms);
    }
    config.validate()?;

    info!(
        "Starting publisher '{}' in {} mode",
        config.worker.id, args.mode
    );
    info!("Endpoint: {}", config.target.endpoint);
    info!("Entity: {}", config.target.entity);
    info!(
        "Concurrent sends: {}, batch fill size: {}, body bytes: {}..{} (large factor {})",
        config.publish.concurrent_sends,
        config.publish.batch_fill_size,
        config.publish.min_bytes,
        config.publish.regular_max_bytes,
        config.publish.large_message_factor
    );

    let factory: Arc<dyn ClientFactory> = match args.mode.as_str() {
        "mock" => Arc::new(MockClientFactory::new(config.mock.clone())),
        "http" => Arc::new(HttpClientFactory::new()),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    let result = run_publisher(config.clone(), factory, &args).await?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = format!("results/publisher_{}_{}.json", config.worker.id, timestamp);

    std::fs::create_dir_all("results").ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)?;

    info!("Results written to {}", output_path);
    print_summary(&result);

    Ok(())
}

async fn run_publisher(
    config: Config,
    factory: Arc<dyn ClientFactory>,
    args: &Args,
) -> Result<PublisherResult> {
    let metrics = Arc::new(MetricsSink::new());
    let errors = Arc::new(ErrorCollector::new());
    let orchestrator = Arc::new(PublishOrchestrator::new(
        config.clone(),
        factory,
        metrics.clone(),
        errors.clone(),
    ));

    let cancel = CancellationToken::new();
    let publisher = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.start(cancel).await })
    };

    let deadline = config.run.duration_ms.map(Duration::from_millis);
    let stop_after = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_after);

    let mut ticker = tokio::time::interval(Duration::from_millis(args.print_every_ms.max(1)));
    ticker.tick().await;
    let mut error_kinds = BTreeMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report_errors(&errors, &mut error_kinds);
                print_progress(&metrics.snapshot(), orchestrator.active_background_senders());
            }
            _ = &mut stop_after => {
                info!("Configured duration elapsed, stopping");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                info!("Interrupted, stopping");
                break;
            }
        }
    }

    cancel.cancel();
    info!("Waiting for in-flight sends to complete...");
    publisher.await.context("Publisher task failed")?;
    report_errors(&errors, &mut error_kinds);

    Ok(PublisherResult {
        publisher_id: config.worker.id.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: args.mode.clone(),
        entity: config.target.entity.clone(),
        generations: orchestrator.generations(),
        next_sequence: orchestrator.next_sequence(),
        metrics: metrics.snapshot(),
        error_kinds,
    })
}

/// Drain collected failures into the log and the per-kind tally.
fn report_errors(errors: &ErrorCollector, error_kinds: &mut BTreeMap<String, u64>) {
    let drained = errors.drain();
    for record in drained.iter().take(MAX_LOGGED_ERRORS_PER_TICK) {
        warn!(
            "[{:?}] generation={} kind={} {}",
            record.category, record.generation, record.kind, record.message
        );
    }
    if drained.len() > MAX_LOGGED_ERRORS_PER_TICK {
        warn!(
            "... {} more error(s) not shown",
            drained.len() - MAX_LOGGED_ERRORS_PER_TICK
        );
    }
    for record in drained {
        *error_kinds.entry(record.kind).or_insert(0) += 1;
    }
}

fn print_progress(snapshot: &MetricsSnapshot, background_senders: usize) {
    info!(
        "Progress: events={} bytes={} batches={} ops={} exceptions={} send_exceptions={} canceled={} general={} restarts={} background={} eps={}",
        snapshot.events_published,
        snapshot.published_bytes,
        snapshot.batches_published,
        snapshot.total_service_operations,
        snapshot.total_exceptions,
        snapshot.send_exceptions,
        snapshot.canceled_send_exceptions,
        snapshot.general_exceptions,
        snapshot.producer_restarts,
        background_senders,
        snapshot.events_per_sec
    );
}

fn print_summary(result: &PublisherResult) {
    let m = &result.metrics;
    println!("\n=== Publisher {} Summary ===", result.publisher_id);
    println!("Mode: {}", result.mode);
    println!("Entity: {}", result.entity);
    println!("Duration: {}ms", m.duration_ms);
    println!("Generations: {}", result.generations);
    println!("Events published: {}", m.events_published);
    println!("Bytes published: {}", m.published_bytes);
    println!("Batches published: {}", m.batches_published);
    println!("Service operations: {}", m.total_service_operations);
    println!("Total exceptions: {}", m.total_exceptions);
    println!("Send exceptions: {}", m.send_exceptions);
    println!("  canceled: {}", m.canceled_send_exceptions);
    println!("  general: {}", m.general_exceptions);
    for (reason, count) in &m.broker_failures {
        println!("  broker/{}: {}", reason, count);
    }
    println!("Producer restarts: {}", m.producer_restarts);
    println!("Achieved events/sec: {}", m.events_per_sec);
    println!();
}
