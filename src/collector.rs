//! Collector receive loop
//!
//! Owns the UDP socket and drives a [`Collector`]: one datagram at a time,
//! ACKs straight back to the sender, periodic reorder sweeps and idle device
//! eviction whenever the bounded wait expires. On shutdown the reorder
//! window collapses to zero so nothing buffered is lost.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::time::{self, error::Elapsed};
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::monitor::{PerformanceMonitor, ProcessStats};
use crate::receiver::{Collector, CollectorConfig, CollectorStats, DeviceState};
use crate::sink::{RecordSink, TelemetryRecord};
use crate::MAX_DATAGRAM_SIZE;

/// Final collector state
#[derive(Debug, Clone)]
pub struct CollectorReport {
    pub stats: CollectorStats,
    /// Devices still known at shutdown, ordered by id
    pub devices: Vec<DeviceState>,
    pub process: ProcessStats,
}

impl CollectorReport {
    pub fn device(&self, device_id: u16) -> Option<&DeviceState> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

enum LoopEvent {
    Shutdown,
    Received(std::result::Result<io::Result<(usize, SocketAddr)>, Elapsed>),
}

/// Socket + pipeline + log sink
pub struct CollectorServer {
    socket: UdpSocket,
    collector: Collector,
    sink: Box<dyn RecordSink>,
    monitor: PerformanceMonitor,
}

impl CollectorServer {
    /// Bind the listening socket
    pub async fn bind(config: CollectorConfig, sink: Box<dyn RecordSink>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!(
            listen = %socket.local_addr()?,
            reorder_window_ms = config.reorder_window.as_millis() as u64,
            device_timeout_s = config.device_timeout.as_secs(),
            "collector started"
        );
        Ok(Self {
            socket,
            collector: Collector::new(config),
            sink,
            monitor: PerformanceMonitor::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` resolves or the socket fails.
    ///
    /// Both paths flush the reorder buffer and log final statistics; a
    /// socket failure is returned after that.
    ///
    /// # Arguments
    /// * `shutdown` - Resolves when the collector should stop
    ///
    /// # Returns
    /// Final statistics, per-device state and process metrics, or the
    /// transport error that stopped the loop
    pub async fn run<F>(mut self, shutdown: F) -> Result<CollectorReport>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let recv_timeout = self.collector.config().recv_timeout;
        let sweep_interval = self.collector.config().sweep_interval;
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_sweep = Instant::now();

        let outcome: Result<()> = loop {
            let event = tokio::select! {
                _ = &mut shutdown => LoopEvent::Shutdown,
                received = time::timeout(recv_timeout, self.socket.recv_from(&mut buffer)) => {
                    LoopEvent::Received(received)
                }
            };

            match event {
                LoopEvent::Shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                LoopEvent::Received(Err(_elapsed)) => {
                    let now = Instant::now();
                    self.collector.evict_idle(now);
                    let released = self.collector.sweep(now);
                    self.write_records(&released);
                    last_sweep = now;
                }
                LoopEvent::Received(Ok(Ok((len, source)))) => {
                    if let Err(e) = self.handle_datagram(&buffer[..len], source).await {
                        break Err(e);
                    }
                    if last_sweep.elapsed() >= sweep_interval {
                        let now = Instant::now();
                        let released = self.collector.sweep(now);
                        self.write_records(&released);
                        last_sweep = now;
                    }
                }
                LoopEvent::Received(Ok(Err(e))) => {
                    error!(error = %e, "receive failed, shutting down");
                    break Err(e.into());
                }
            }
        };

        let report = self.finish();
        outcome.map(|()| report)
    }

    async fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) -> Result<()> {
        let processed = match self.collector.process_datagram(data, source, Instant::now()) {
            Ok(processed) => processed,
            // Already logged by the pipeline
            Err(e) if e.is_malformed() => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(ack) = &processed.ack {
            if let Err(e) = self.socket.send_to(ack, source).await {
                error!(error = %e, to = %source, "ACK send failed, shutting down");
                return Err(e.into());
            }
            debug!(device_id = processed.header.device_id, seq = processed.header.seq_num, "ACK sent");
        }

        self.write_records(&processed.records);
        Ok(())
    }

    fn write_records(&mut self, records: &[TelemetryRecord]) {
        for record in records {
            if let Err(e) = self.sink.write_record(record) {
                error!(error = %e, device_id = record.device_id, seq = record.seq_num, "log write failed");
            }
        }
    }

    fn finish(mut self) -> CollectorReport {
        let released = self.collector.flush(Instant::now());
        self.write_records(&released);

        let stats = self.collector.stats();
        let mut devices: Vec<DeviceState> = self.collector.devices().cloned().collect();
        devices.sort_by_key(|d| d.device_id);
        let process = self.monitor.sample();

        for device in &devices {
            info!(
                device_id = device.device_id,
                packets = device.packet_count,
                heartbeats = device.heartbeat_count,
                last_seq = device.last_seq,
                "device summary"
            );
        }
        info!(
            received = stats.total_received,
            lost = stats.total_lost,
            duplicates = stats.total_duplicates,
            loss_rate = stats.loss_rate(),
            bytes = stats.total_bytes,
            malformed = stats.malformed,
            processing_ms = stats.processing_time.as_secs_f64() * 1000.0,
            cpu_percent = process.cpu_percent,
            memory_mb = process.memory_mb,
            elapsed_s = process.elapsed.as_secs_f64(),
            "collector finished"
        );

        CollectorReport {
            stats,
            devices,
            process,
        }
    }
}
