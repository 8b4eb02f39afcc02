//! Transmitter module - sensor side of the protocol
//!
//! [`SensorSession`] turns readings into wire packets. It owns the sequence
//! counter and the batch buffer, applies simulated loss and jitter, and
//! shares a [`SharedReliability`] with two background tasks: the ACK
//! listener and the retransmission timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::ack_manager::{lock, run_ack_listener, run_retransmit_timer, ReliabilityState, SharedReliability};
use crate::errors::{Result, TelemetryError};
use crate::protocol::{encode_batch, encode_message, BatchReading, DataReading, MessageKind};

/// Sensor configuration
///
/// Defaults: 1 s interval, 60 s run, no loss, no jitter, no batching,
/// heartbeat after 10 s of silence.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub device_id: u16,
    pub destination: SocketAddr,
    /// Local bind address; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,
    pub interval: Duration,
    pub duration: Duration,
    /// Probability in `[0, 1]` that a DATA send is silently dropped
    pub packet_loss_rate: f64,
    /// Upper bound of the uniform per-DATA send delay; zero disables jitter
    pub jitter_max: Duration,
    /// Readings per BATCH; zero sends each reading as DATA
    pub batch_size: usize,
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub initial_rtt: Duration,
    pub retransmit_period: Duration,
    pub ack_poll_timeout: Duration,
    /// Wait for trailing ACKs at shutdown
    pub grace_period: Duration,
    /// Application payload ceiling for BATCH packets
    pub max_payload: usize,
    /// Seed for the loss/jitter/reading RNG; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device_id: 1001,
            destination: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            interval: Duration::from_secs(1),
            duration: Duration::from_secs(60),
            packet_loss_rate: 0.0,
            jitter_max: Duration::ZERO,
            batch_size: 0,
            heartbeat_interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            max_retries: crate::MAX_RETRANSMIT_ATTEMPTS,
            initial_rtt: Duration::from_secs(1),
            retransmit_period: Duration::from_millis(crate::RETRANSMIT_SWEEP_MS),
            ack_poll_timeout: Duration::from_millis(crate::ACK_POLL_TIMEOUT_MS),
            grace_period: Duration::from_secs(2),
            max_payload: crate::MAX_APP_PAYLOAD,
            seed: None,
        }
    }
}

impl SensorConfig {
    pub fn new(device_id: u16, destination: SocketAddr) -> Self {
        Self {
            device_id,
            destination,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_packet_loss_rate(mut self, rate: f64) -> Self {
        self.packet_loss_rate = rate;
        self
    }

    pub fn with_jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_initial_rtt(mut self, rtt: Duration) -> Self {
        self.initial_rtt = rtt;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject values that would make the session misbehave
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.packet_loss_rate) {
            return Err(TelemetryError::InvalidConfig(format!(
                "packet loss rate {} not in [0, 1]",
                self.packet_loss_rate
            )));
        }
        if self.interval.is_zero() {
            return Err(TelemetryError::InvalidConfig("send interval must be > 0".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TelemetryError::InvalidConfig("heartbeat interval must be > 0".into()));
        }
        if self.retransmit_period.is_zero() || self.ack_poll_timeout.is_zero() {
            return Err(TelemetryError::InvalidConfig("timer periods must be > 0".into()));
        }
        Ok(())
    }
}

/// Final counters printed at shutdown
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderReport {
    pub sent: u64,
    pub dropped: u64,
    pub acked: u64,
    pub retransmitted: u64,
    pub lost: u64,
    pub still_pending: usize,
    pub estimated_rtt: Duration,
    pub rto: Duration,
}

/// Split readings into BATCH payloads no larger than `ceiling` bytes.
///
/// Each payload is keyed by the sequence number of its last reading. An
/// oversized buffer is halved recursively; a single reading that still
/// exceeds the ceiling is sent as-is.
///
/// # Arguments
/// * `readings` - Buffered readings, in sequence order
/// * `ceiling` - Application payload limit in bytes
///
/// # Returns
/// `(seq_num, payload)` pairs that partition `readings` in order; empty
/// when `readings` is empty
pub fn split_batch(readings: &[BatchReading], ceiling: usize) -> Result<Vec<(u16, Vec<u8>)>> {
    let Some(last) = readings.last() else {
        return Ok(Vec::new());
    };

    let payload = encode_batch(readings)?;
    if payload.len() <= ceiling || readings.len() == 1 {
        return Ok(vec![(last.seq_num, payload)]);
    }

    let (left, right) = readings.split_at(readings.len() / 2);
    let mut parts = split_batch(left, ceiling)?;
    parts.extend(split_batch(right, ceiling)?);
    Ok(parts)
}

/// One sensor's protocol session
pub struct SensorSession {
    config: SensorConfig,
    socket: Arc<UdpSocket>,
    reliability: SharedReliability,
    seq_num: u16,
    batch: Vec<BatchReading>,
    rng: StdRng,
    background: Vec<JoinHandle<()>>,
    jitter_tasks: JoinSet<()>,
}

impl SensorSession {
    /// Bind the socket and start the ACK listener and retransmit timer
    pub async fn connect(config: SensorConfig) -> Result<Self> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local = socket.local_addr()?;
        let reliability = ReliabilityState::new(config.initial_rtt, config.max_retries).shared();

        let background = vec![
            tokio::spawn(run_ack_listener(
                socket.clone(),
                reliability.clone(),
                config.device_id,
                config.ack_poll_timeout,
            )),
            tokio::spawn(run_retransmit_timer(
                socket.clone(),
                reliability.clone(),
                config.retransmit_period,
            )),
        ];

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            device_id = config.device_id,
            target = %config.destination,
            local = %local,
            loss_rate = config.packet_loss_rate,
            jitter_ms = config.jitter_max.as_millis() as u64,
            batch_size = config.batch_size,
            "sensor session started"
        );

        Ok(Self {
            config,
            socket,
            reliability,
            seq_num: 0,
            batch: Vec::new(),
            rng,
            background,
            jitter_tasks: JoinSet::new(),
        })
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Sequence number the next INIT/DATA reading will carry
    pub fn next_seq(&self) -> u16 {
        self.seq_num
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Handle to the shared reliability state, for inspection
    pub fn reliability(&self) -> SharedReliability {
        self.reliability.clone()
    }

    /// Change the simulated loss rate mid-session
    pub fn set_packet_loss_rate(&mut self, rate: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(TelemetryError::InvalidConfig(format!("packet loss rate {} not in [0, 1]", rate)));
        }
        self.config.packet_loss_rate = rate;
        Ok(())
    }

    /// Jittered sends still waiting out their delay
    pub fn jitter_tasks_in_flight(&self) -> usize {
        self.jitter_tasks.len()
    }

    fn reap_jitter_tasks(&mut self) {
        while let Some(joined) = self.jitter_tasks.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "jitter task aborted");
            }
        }
    }

    /// Readings waiting for the next BATCH
    pub fn buffered_readings(&self) -> &[BatchReading] {
        &self.batch
    }

    fn take_seq(&mut self) -> u16 {
        let seq = self.seq_num;
        self.seq_num = self.seq_num.wrapping_add(1);
        seq
    }

    /// Send INIT; consumes one sequence number
    pub async fn send_init(&mut self) -> Result<()> {
        let seq = self.take_seq();
        let message = encode_message(MessageKind::Init, self.config.device_id, seq, &[], None, 0);
        self.socket.send_to(&message, self.config.destination).await?;
        lock(&self.reliability).record_sent();
        info!(device_id = self.config.device_id, seq, "sent INIT");
        Ok(())
    }

    /// Send HEARTBEAT; always seq 0 and never touches the counter
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        let message = encode_message(MessageKind::Heartbeat, self.config.device_id, 0, &[], None, 0);
        self.socket.send_to(&message, self.config.destination).await?;
        lock(&self.reliability).record_sent();
        info!(device_id = self.config.device_id, "sent HEARTBEAT");
        Ok(())
    }

    /// Send one reading.
    ///
    /// The loss roll comes first: a dropped reading still consumes its
    /// sequence number so the collector sees the gap. With batching on, the
    /// reading is buffered and a BATCH goes out once the buffer is full.
    pub async fn send_data(&mut self, temperature: f64, humidity: f64) -> Result<()> {
        let reading = DataReading::rounded(temperature, humidity);
        self.reap_jitter_tasks();

        if self.config.packet_loss_rate > 0.0 && self.rng.gen::<f64>() < self.config.packet_loss_rate {
            let seq = self.take_seq();
            lock(&self.reliability).record_dropped();
            warn!(device_id = self.config.device_id, seq, "simulated loss: DATA dropped");
            return Ok(());
        }

        if self.config.batch_size > 0 {
            let seq = self.take_seq();
            self.batch.push(BatchReading::new(seq, reading));
            debug!(seq, buffered = self.batch.len(), "reading buffered");
            if self.batch.len() >= self.config.batch_size {
                self.send_batch().await?;
            }
            return Ok(());
        }

        let seq = self.seq_num;
        let payload = reading.to_json()?;
        let message = encode_message(MessageKind::Data, self.config.device_id, seq, &payload, None, 0);

        if self.config.jitter_max.is_zero() {
            transmit_tracked(&self.socket, &self.reliability, seq, message, self.config.destination).await?;
            info!(
                device_id = self.config.device_id,
                seq,
                temperature = reading.temperature,
                humidity = reading.humidity,
                "sent DATA"
            );
        } else {
            let delay = self.rng.gen_range(Duration::ZERO..=self.config.jitter_max);
            let socket = self.socket.clone();
            let reliability = self.reliability.clone();
            let destination = self.config.destination;
            self.jitter_tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                match transmit_tracked(&socket, &reliability, seq, message, destination).await {
                    Ok(()) => debug!(seq, delay_ms = delay.as_millis() as u64, "sent jittered DATA"),
                    Err(e) => error!(seq, error = %e, "jittered DATA send failed"),
                }
            });
        }

        self.take_seq();
        Ok(())
    }

    /// Flush the batch buffer as one or more BATCH packets.
    ///
    /// A BATCH reuses the sequence number of its last reading instead of
    /// drawing a new one.
    pub async fn send_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let parts = split_batch(&self.batch, self.config.max_payload)?;
        if parts.len() > 1 {
            info!(
                readings = self.batch.len(),
                packets = parts.len(),
                "batch exceeds payload ceiling, split"
            );
        }

        for (seq, payload) in parts {
            if payload.len() > self.config.max_payload {
                warn!(seq, bytes = payload.len(), "single reading exceeds payload ceiling, sending anyway");
            }
            let message = encode_message(MessageKind::Batch, self.config.device_id, seq, &payload, None, 0);
            let bytes = message.len();
            transmit_tracked(&self.socket, &self.reliability, seq, message, self.config.destination).await?;
            info!(device_id = self.config.device_id, seq, bytes, "sent BATCH");
        }

        self.batch.clear();
        Ok(())
    }

    /// Simulated reading: 22±3 °C, 55±10 %
    pub fn simulate_reading(&mut self) -> (f64, f64) {
        let temperature = 22.0 + self.rng.gen_range(-3.0..=3.0);
        let humidity = 55.0 + self.rng.gen_range(-10.0..=10.0);
        (temperature, humidity)
    }

    /// INIT, then one reading per interval for the configured duration,
    /// with heartbeats during quiet stretches. Always ends with
    /// [`shutdown`](Self::shutdown); a transport error is returned after the
    /// report has been logged.
    pub async fn run(mut self) -> Result<SenderReport> {
        let outcome = self.send_loop().await;
        let report = self.shutdown().await;
        outcome.map(|()| report)
    }

    async fn send_loop(&mut self) -> Result<()> {
        self.send_init().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let end = tokio::time::Instant::now() + self.config.duration;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        let mut last_heartbeat = Instant::now();

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            duration_s = self.config.duration.as_secs(),
            "starting data transmission"
        );

        loop {
            let heartbeat_due = tokio::time::Instant::from_std(self.heartbeat_deadline(last_heartbeat));

            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(end) => break,
                _ = ticker.tick() => {
                    let (temperature, humidity) = self.simulate_reading();
                    self.send_data(temperature, humidity).await?;
                }
                _ = tokio::time::sleep_until(heartbeat_due) => {
                    self.send_heartbeat().await?;
                    last_heartbeat = Instant::now();
                }
            }
        }

        Ok(())
    }

    /// When the next HEARTBEAT is due: one heartbeat interval after the later
    /// of the last DATA/BATCH write and the last heartbeat. Simulated drops
    /// and buffered readings never put anything on the wire, so they do not
    /// push the deadline back.
    fn heartbeat_deadline(&self, last_heartbeat: Instant) -> Instant {
        let last_activity = match lock(&self.reliability).last_data_written() {
            Some(written) => written.max(last_heartbeat),
            None => last_heartbeat,
        };
        last_activity + self.config.heartbeat_interval
    }

    /// Flush any buffered readings, wait out the grace period for trailing
    /// ACKs, stop the background tasks and report the counters.
    pub async fn shutdown(mut self) -> SenderReport {
        if let Err(e) = self.send_batch().await {
            error!(error = %e, "failed to flush batch at shutdown");
        }

        while let Some(joined) = self.jitter_tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "jitter task aborted");
            }
        }

        tokio::time::sleep(self.config.grace_period).await;

        for task in &self.background {
            task.abort();
        }

        let guard = lock(&self.reliability);
        let stats = guard.stats();
        let report = SenderReport {
            sent: stats.sent,
            dropped: stats.dropped,
            acked: stats.acked,
            retransmitted: stats.retransmitted,
            lost: stats.lost,
            still_pending: guard.pending_len(),
            estimated_rtt: guard.rtt().estimated_rtt(),
            rto: guard.rtt().rto(),
        };
        drop(guard);

        info!(
            device_id = self.config.device_id,
            sent = report.sent,
            dropped = report.dropped,
            acked = report.acked,
            retransmitted = report.retransmitted,
            lost = report.lost,
            pending = report.still_pending,
            rtt_ms = report.estimated_rtt.as_secs_f64() * 1000.0,
            rto_ms = report.rto.as_secs_f64() * 1000.0,
            "sensor session finished"
        );
        report
    }
}

/// Register `message` as pending, then write it.
///
/// Registration happens first so an ACK can never arrive before its packet
/// is in the table. A failed write removes the entry again.
async fn transmit_tracked(
    socket: &UdpSocket,
    reliability: &SharedReliability,
    seq: u16,
    message: Vec<u8>,
    destination: SocketAddr,
) -> Result<()> {
    lock(reliability).register(seq, message.clone(), destination, Instant::now());
    if let Err(e) = socket.send_to(&message, destination).await {
        lock(reliability).cancel(seq);
        return Err(e.into());
    }
    lock(reliability).mark_data_written(Instant::now());
    Ok(())
}
