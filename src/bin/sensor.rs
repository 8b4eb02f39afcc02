//! TinyTelemetry sensor
//!
//! Sends simulated temperature/humidity readings to a collector over UDP,
//! retransmitting DATA and BATCH packets until they are acknowledged.
//!
//! ```bash
//! tt-sensor --device-id 1001 --interval 1 --duration 60
//! tt-sensor --loss-rate 0.1 --jitter 0.2 --batch-size 5 --seed 7
//! ```

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tinytelemetry::transmitter::{SensorConfig, SensorSession};
use tracing_subscriber::EnvFilter;

/// TinyTelemetry sensor client.
#[derive(Parser, Debug)]
#[command(name = "tt-sensor", about = "TinyTelemetry sensor client")]
struct Cli {
    /// Device identifier carried in every header.
    #[arg(long, default_value_t = 1001)]
    device_id: u16,

    /// Seconds between readings.
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Total run time in seconds.
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Probability in [0, 1] of silently dropping a DATA send.
    #[arg(long, default_value_t = 0.0)]
    loss_rate: f64,

    /// Maximum random send delay in seconds.
    #[arg(long, default_value_t = 0.0)]
    jitter: f64,

    /// Readings per BATCH packet; 0 sends plain DATA.
    #[arg(long, default_value_t = 0)]
    batch_size: usize,

    /// Collector host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Collector port.
    #[arg(long, default_value_t = tinytelemetry::DEFAULT_PORT)]
    port: u16,

    /// Seconds of silence before a HEARTBEAT is sent.
    #[arg(long, default_value_t = tinytelemetry::DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    heartbeat_interval: u64,

    /// RNG seed for reproducible loss, jitter and readings.
    #[arg(long)]
    seed: Option<u64>,
}

fn seconds(value: f64, name: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{} value {}", name, value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let destination = tokio::net::lookup_host((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("resolving {}:{}", cli.host, cli.port))?
        .next()
        .with_context(|| format!("no address for {}", cli.host))?;

    let mut config = SensorConfig::new(cli.device_id, destination)
        .with_interval(seconds(cli.interval, "interval")?)
        .with_duration(Duration::from_secs(cli.duration))
        .with_packet_loss_rate(cli.loss_rate)
        .with_jitter_max(seconds(cli.jitter, "jitter")?)
        .with_batch_size(cli.batch_size)
        .with_heartbeat_interval(Duration::from_secs(cli.heartbeat_interval));
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }

    let session = SensorSession::connect(config).await?;
    let report = session.run().await?;

    println!(
        "sent={} dropped={} acked={} retransmitted={} lost={} pending={} rtt={:.1}ms rto={:.1}ms",
        report.sent,
        report.dropped,
        report.acked,
        report.retransmitted,
        report.lost,
        report.still_pending,
        report.estimated_rtt.as_secs_f64() * 1000.0,
        report.rto.as_secs_f64() * 1000.0,
    );
    Ok(())
}
