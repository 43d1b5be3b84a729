//! Prometheus exporter for DSMR/P1 smart meters.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use p1_exporter::{
    DemoSource, ExporterConfig, HttpServer, IngestHandle, Ingestor, Lifecycle, LifecycleState,
    LineSource, MappingTable, MetricState, SourceConfig,
};

/// Upper bound on how long shutdown waits for tasks to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Prometheus exporter for DSMR/P1 smart meters.
#[derive(Parser, Debug)]
#[command(name = "p1-exporter")]
#[command(about = "Export DSMR/P1 smart-meter readings as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Address on which to expose metrics and the landing page (overrides config).
    #[arg(long)]
    listen_address: Option<String>,

    /// Stream of decoded telegrams, one JSON document per line; `-` for stdin.
    #[arg(long, conflicts_with = "demo")]
    device: Option<String>,

    /// Generate synthetic telegrams instead of reading a stream.
    #[arg(long)]
    demo: bool,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file, then apply command-line overrides.
    fn into_config(self) -> anyhow::Result<ExporterConfig> {
        let mut config = match &self.config {
            Some(path) => ExporterConfig::load_from_file(path)?,
            None => ExporterConfig::default(),
        };

        if let Some(listen) = self.listen_address {
            config.web.listen = listen;
        }
        if let Some(path) = self.device {
            config.source = SourceConfig::Stream { path };
        }
        if self.demo && !matches!(config.source, SourceConfig::Demo { .. }) {
            config.source = SourceConfig::demo();
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Open the configured source and start ingesting from it.
async fn start_ingest(
    ingestor: Ingestor,
    source: &SourceConfig,
) -> anyhow::Result<IngestHandle> {
    let handle = match source {
        SourceConfig::Stream { path } => ingestor.spawn(LineSource::open(path).await?),
        SourceConfig::Demo { interval_ms } => {
            info!(interval_ms, "Using demo telegram source");
            ingestor.spawn(DemoSource::new(Duration::from_millis(*interval_ms)))
        }
    };
    Ok(handle)
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));

    // A read blocked on stdin never returns on its own; do not wait for it.
    runtime.shutdown_background();
    result
}

async fn run(config: ExporterConfig) -> anyhow::Result<()> {
    p1_common::init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting P1 exporter");

    let metrics = Arc::new(MetricState::new());
    let lifecycle = LifecycleState::new();

    // Bind first so an unusable address fails before anything is spawned.
    let server = HttpServer::new(
        metrics.clone(),
        lifecycle.clone(),
        config.listen_addr()?,
        config.web.metrics_path.clone(),
    )
    .bind()
    .await
    .inspect_err(|e| error!(error = %e, "Failed to start HTTP server"))?;

    let ingestor = Ingestor::new(metrics.clone(), MappingTable::standard());
    let ingest = start_ingest(ingestor, &config.source)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to open telegram source"))?;

    lifecycle.advance(Lifecycle::Running);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let http_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    shutdown_signal().await;
    lifecycle.advance(Lifecycle::ShuttingDown);

    // Fails only when the server already exited.
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let outcome = ingest.stop().await;
        info!(?outcome, "Ingestion stopped");
        let _ = http_task.await;
    })
    .await;
    if drained.is_err() {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Tasks did not finish in time"
        );
    }

    lifecycle.advance(Lifecycle::Stopped);

    let stats = metrics.stats();
    info!(
        telegrams = stats.telegrams,
        readings = stats.readings,
        readings_unmapped = stats.readings_unmapped,
        readings_malformed = stats.readings_malformed,
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
