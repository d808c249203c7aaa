use chat_relay_persistence::Storage;
use chat_relay_worker::metrics::serve as serve_metrics;
use chat_relay_worker::{OpenAiClient, Relay, RelayConfig, RelayMetrics, TelegramClient};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cr-relay")]
#[command(about = "Durable chat-to-completion relay", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of items handled concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// Completion model
    #[arg(long)]
    model: Option<String>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();

    // Load configuration
    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        RelayConfig::from_file(&args.config)?
    } else {
        RelayConfig::default()
    };

    // Override with CLI args and environment
    if let Some(data_dir) = args.data_dir {
        config.persistence.data_dir = data_dir;
    }
    if let Some(concurrency) = args.concurrency {
        config.dispatch.concurrency = concurrency;
    }
    if let Some(model) = args.model {
        config.completion.model = model;
    }
    if let Some(port) = args.metrics_port {
        config.monitoring.metrics_port = Some(port);
    }
    config.monitoring.json_logs |= args.json_logs;
    config.apply_env();

    init_tracing(&config);
    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    config.validate()?;

    let storage = Storage::open(config.to_storage_config())?;
    let metrics = Arc::new(RelayMetrics::new()?);

    if let Some(port) = config.monitoring.metrics_port {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(metrics, port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    let source = Arc::new(TelegramClient::new(&config.source)?);
    let completion = Arc::new(OpenAiClient::new(&config.completion)?);
    let relay = Relay::new(&config, &storage, source, completion, metrics);

    // Handle shutdown signals
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        signal.cancel();
    });

    relay.run(shutdown).await;

    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.monitoring.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.monitoring.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
