//! TinyTelemetry collector
//!
//! Listens for sensor traffic, acknowledges DATA and BATCH packets, and
//! appends every reading to a CSV log until interrupted.
//!
//! ```bash
//! tt-collector --port 5000
//! tt-collector --bind 127.0.0.1 --csv run1.csv --reorder-window 1.5
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tinytelemetry::collector::CollectorServer;
use tinytelemetry::receiver::CollectorConfig;
use tinytelemetry::sink::{CsvLog, RecordSink};
use tracing_subscriber::EnvFilter;

/// TinyTelemetry collector server.
#[derive(Parser, Debug)]
#[command(name = "tt-collector", about = "TinyTelemetry collector server")]
struct Cli {
    /// UDP listen port.
    #[arg(long, default_value_t = tinytelemetry::DEFAULT_PORT)]
    port: u16,

    /// Local address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// CSV log path; defaults to telemetry_<timestamp>.csv in the working directory.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Reorder window in seconds.
    #[arg(long, default_value_t = tinytelemetry::DEFAULT_REORDER_WINDOW_SECS as f64)]
    reorder_window: f64,

    /// Seconds of silence before a device is forgotten.
    #[arg(long, default_value_t = tinytelemetry::DEFAULT_DEVICE_TIMEOUT_SECS)]
    device_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let reorder_window = Duration::try_from_secs_f64(cli.reorder_window)
        .with_context(|| format!("invalid --reorder-window value {}", cli.reorder_window))?;
    let config = CollectorConfig::new(SocketAddr::new(cli.bind, cli.port))
        .with_reorder_window(reorder_window)
        .with_device_timeout(Duration::from_secs(cli.device_timeout));

    let log = match &cli.csv {
        Some(path) => CsvLog::create(path),
        None => CsvLog::create_timestamped("."),
    }
    .context("opening CSV log")?;
    tracing::info!(path = %log.path().display(), "logging to CSV");
    let sink: Box<dyn RecordSink> = Box::new(log);

    let server = CollectorServer::bind(config, sink).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let report = server.run(shutdown).await?;
    println!(
        "received={} lost={} duplicates={} loss_rate={:.2}% devices={}",
        report.stats.total_received,
        report.stats.total_lost,
        report.stats.total_duplicates,
        report.stats.loss_rate(),
        report.devices.len(),
    );
    Ok(())
}
