//! SIEM event streaming service.
//! Runs the orchestrator with in-process demo clients fed by the event generator.

use anyhow::{Context, Result};
use clap::Parser;
use siem_event_streaming::config::LoggingConfig;
use siem_event_streaming::generator::EventGenerator;
use siem_event_streaming::{ChannelTransport, ClientType, OutboundMessage, StreamingConfig, StreamingOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "siem-stream", version, about = "Per-client SIEM event streaming service")]
struct Cli {
    /// Configuration file (.toml or .yaml). Without it, STREAM_CONFIG_PATH and STREAM__* apply.
    #[arg(short, long, env = "SIEM_STREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Number of in-process demo clients to connect.
    #[arg(long, default_value_t = 3)]
    demo_clients: usize,

    /// Stop after this many seconds; runs until Ctrl-C when omitted.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Run the synthetic event generator even if the configuration disables it.
    #[arg(long)]
    generate: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate_config: bool,
}

const DEMO_CLIENT_TYPES: [ClientType; 4] = [ClientType::Web, ClientType::Cli, ClientType::Api, ClientType::Mobile];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings live in the configuration, so loading it reports
    // through a plain stderr subscriber.
    let bootstrap = tracing_subscriber::fmt().with_target(false).with_writer(std::io::stderr).finish();
    let config = tracing::subscriber::with_default(bootstrap, || load_config(&cli))?;
    init_tracing(&config.logging);

    if cli.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }
    print_config_summary(&config);

    let transport = Arc::new(ChannelTransport::new(config.orchestrator.client_queue_capacity));
    let orchestrator = Arc::new(
        StreamingOrchestrator::new(config.clone(), transport.clone()).context("Failed to build orchestrator")?,
    );
    let cancel = CancellationToken::new();

    let mut handles = orchestrator.start_background_tasks(cancel.clone());
    handles.push(spawn_alert_logger(&orchestrator, cancel.clone()));

    for i in 0..cli.demo_clients {
        let client_id = format!("demo-{}", i + 1);
        let client_type = DEMO_CLIENT_TYPES[i % DEMO_CLIENT_TYPES.len()];
        let rx = transport.register(&client_id);
        handles.push(tokio::spawn(drain_client(client_id.clone(), rx)));

        if let Err(e) = orchestrator
            .connect_client(&client_id, Some(format!("analyst-{}", i + 1)), client_type)
            .await
        {
            error!("Failed to connect demo client {}: {}", client_id, e);
        }
    }

    if config.generator.enabled || cli.generate {
        handles.push(EventGenerator::new(config.generator.clone()).spawn(Arc::clone(&orchestrator), cancel.clone()));
    }

    match cli.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Run duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    cancel.cancel();
    for i in 0..cli.demo_clients {
        let client_id = format!("demo-{}", i + 1);
        orchestrator.disconnect_client(&client_id);
        transport.unregister(&client_id);
    }
    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    match orchestrator.metrics().export() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to export metrics: {}", e),
    }
    let snapshot = orchestrator.metrics().snapshot();
    info!(
        "Shutdown complete: {} events received, {} delivered, {} blocked, {} throttled",
        snapshot.events_received, snapshot.events_delivered, snapshot.events_blocked, snapshot.events_throttled
    );
    Ok(())
}

fn load_config(cli: &Cli) -> Result<StreamingConfig> {
    match &cli.config {
        Some(path) => StreamingConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => StreamingConfig::load_with_overrides().context("Failed to load configuration"),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("siem_event_streaming={0},siem_stream={0}", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

fn print_config_summary(config: &StreamingConfig) {
    info!("=== Configuration Summary ===");
    info!(
        "Throttling: {} events/s, window {}ms, adaptive={}",
        config.throttling.max_events_per_second, config.throttling.window_size_ms, config.throttling.adaptive_mode
    );
    info!(
        "Filtering: enabled={}, budget {}ms, default rules={}",
        config.filtering.enabled, config.filtering.max_evaluation_time_ms, config.filtering.install_default_rules
    );
    info!(
        "Channels: {} per client, max window {}ms",
        config.channels.max_channels_per_client, config.channels.max_aggregation_window_ms
    );
    info!("Client queue capacity: {}", config.orchestrator.client_queue_capacity);
    info!("================================");
}

/// Stand-in for a connection writer: logs what each demo client receives.
async fn drain_client(client_id: String, mut rx: mpsc::Receiver<OutboundMessage>) {
    while let Some(message) = rx.recv().await {
        match &message {
            OutboundMessage::Event { channel_id, event, .. } => info!(
                "[{}] {} {} event on {}",
                client_id,
                event.severity(),
                event.event_type(),
                channel_id
            ),
            OutboundMessage::Aggregation { channel_id, aggregation } => {
                info!("[{}] aggregation of {} events on {}", client_id, aggregation.count, channel_id)
            }
            OutboundMessage::ThrottleUpdate { recommendation } => info!(
                "[{}] throttled to {}/s ({})",
                client_id, recommendation.recommended_rate, recommendation.throttle_level
            ),
            other => debug!("[{}] {}", client_id, other.kind()),
        }
    }
    debug!("Queue for {} closed", client_id);
}

fn spawn_alert_logger(orchestrator: &Arc<StreamingOrchestrator>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut alerts = orchestrator.filtering().subscribe_alerts();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                alert = alerts.recv() => match alert {
                    Ok(alert) => warn!(
                        "ALERT [{}] {} (client {}, event {})",
                        alert.rule_name, alert.message, alert.client_id, alert.correlation_id
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Alert logger lagged, skipped {} alerts", skipped)
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
