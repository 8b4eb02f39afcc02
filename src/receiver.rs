//! Collector processing pipeline
//!
//! [`Collector`] takes one datagram at a time and:
//! 1. decodes header and payload (malformed packets are rejected, nothing else changes)
//! 2. decides whether to ACK (DATA and BATCH only)
//! 3. classifies the packet against its device's state: duplicate, gap, retransmit
//! 4. updates the device state and running totals
//! 5. displays INIT/HEARTBEAT/BATCH and duplicates immediately, and parks
//!    fresh DATA in the [`ReorderBuffer`]
//!
//! It does no I/O. The receive loop in [`crate::collector`] owns the socket,
//! sends the ACKs and forwards [`TelemetryRecord`]s to the log sink. One
//! datagram is processed at a time, so the device table needs no locking.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::ack_manager::AckManager;
use crate::errors::Result;
use crate::protocol::{decode_batch, decode_message, BatchReading, DataReading, Header, MessageKind};
use crate::reorder::{BufferedPacket, ReorderBuffer};
use crate::sink::TelemetryRecord;

/// Collector configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub bind_addr: SocketAddr,
    /// Hold time for DATA packets before ordered release
    pub reorder_window: Duration,
    /// Forced sweep period while packets keep arriving
    pub sweep_interval: Duration,
    /// Bounded wait of the receive loop
    pub recv_timeout: Duration,
    /// Devices silent for longer than this are evicted
    pub device_timeout: Duration,
    /// Payloads above this are accepted but logged as oversized
    pub max_payload: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            reorder_window: Duration::from_secs(crate::DEFAULT_REORDER_WINDOW_SECS),
            sweep_interval: Duration::from_secs(crate::DEFAULT_SWEEP_INTERVAL_SECS),
            recv_timeout: Duration::from_secs(crate::DEFAULT_RECV_TIMEOUT_SECS),
            device_timeout: Duration::from_secs(crate::DEFAULT_DEVICE_TIMEOUT_SECS),
            max_payload: crate::MAX_APP_PAYLOAD,
        }
    }
}

impl CollectorConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    pub fn with_reorder_window(mut self, window: Duration) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }
}

/// Per-device sequence and liveness state
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_id: u16,
    /// Last accepted non-duplicate sequence number
    pub last_seq: Option<u16>,
    pub last_timestamp: u32,
    pub packet_count: u64,
    pub heartbeat_count: u64,
    pub last_seen: Instant,
    /// Highest reading sequence number seen inside BATCH payloads
    pub last_reading_seq: Option<u16>,
    /// Every accepted sequence number
    pub seen: HashSet<u16>,
}

impl DeviceState {
    fn new(device_id: u16, now: Instant) -> Self {
        Self {
            device_id,
            last_seq: None,
            last_timestamp: 0,
            packet_count: 0,
            heartbeat_count: 0,
            last_seen: now,
            last_reading_seq: None,
            seen: HashSet::new(),
        }
    }
}

/// Running totals across all devices
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollectorStats {
    /// INIT, DATA, HEARTBEAT and each BATCH reading count once
    pub total_received: u64,
    /// Sum of all gap sizes, including gaps inside batches
    pub total_lost: u64,
    pub total_duplicates: u64,
    pub total_bytes: u64,
    pub malformed: u64,
    pub oversized: u64,
    /// Time spent inside [`Collector::process_datagram`]
    pub processing_time: Duration,
}

impl CollectorStats {
    /// Lost readings as a percentage of received + lost
    pub fn loss_rate(&self) -> f64 {
        let total = self.total_received + self.total_lost;
        if total == 0 {
            return 0.0;
        }
        self.total_lost as f64 / total as f64 * 100.0
    }
}

/// How a packet relates to what its device sent before
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub duplicate: bool,
    /// Duplicates are always reported as retransmits too
    pub retransmit: bool,
    /// Number of sequence numbers skipped, if any
    pub gap: Option<u16>,
}

/// What happened to a processed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Shown and logged right away
    Displayed,
    /// Parked in the reorder buffer
    Buffered,
}

/// Result of processing one datagram
#[derive(Debug, Clone)]
pub struct Processed {
    pub header: Header,
    /// ACK to send back to the source
    pub ack: Option<Vec<u8>>,
    pub classification: Classification,
    pub disposition: Disposition,
    /// Records for the log sink produced by immediate display
    pub records: Vec<TelemetryRecord>,
}

/// Kind-specific decoded payload
enum Body {
    Empty,
    Data(DataReading),
    Batch(Vec<BatchReading>),
}

fn decode_body(kind: MessageKind, payload: &[u8]) -> Result<Body> {
    match kind {
        MessageKind::Data => Ok(Body::Data(DataReading::from_json(payload)?)),
        MessageKind::Batch => Ok(Body::Batch(decode_batch(payload)?)),
        _ => Ok(Body::Empty),
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Gap between `last` and `seq`, if `seq` skips ahead
fn gap_after(last: u16, seq: u16) -> Option<u16> {
    let expected = last as u32 + 1;
    (seq as u32 > expected).then(|| (seq as u32 - expected) as u16)
}

/// Per-device classification, acknowledgment and ordered release
#[derive(Debug)]
pub struct Collector {
    config: CollectorConfig,
    devices: HashMap<u16, DeviceState>,
    reorder: ReorderBuffer,
    stats: CollectorStats,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        let reorder = ReorderBuffer::new(config.reorder_window);
        Self {
            config,
            devices: HashMap::new(),
            reorder,
            stats: CollectorStats::default(),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    pub fn device(&self, device_id: u16) -> Option<&DeviceState> {
        self.devices.get(&device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values()
    }

    /// Packets waiting in the reorder buffer
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Process one datagram received from `source` at `now`.
    ///
    /// A malformed datagram returns an error and leaves all device state
    /// untouched; only the byte and malformed counters move.
    ///
    /// # Arguments
    /// * `data` - Complete UDP payload, header included
    /// * `source` - Sender address; ACKs go back here
    /// * `now` - Arrival time, used for liveness and the reorder window
    ///
    /// # Returns
    /// The decoded header, the ACK to send (DATA/BATCH only), the
    /// classification and any records ready for the log sink
    pub fn process_datagram(&mut self, data: &[u8], source: SocketAddr, now: Instant) -> Result<Processed> {
        let started = Instant::now();
        self.stats.total_bytes += data.len() as u64;

        let result = self.process_inner(data, source, now);
        if let Err(e) = &result {
            self.stats.malformed += 1;
            warn!(from = %source, bytes = data.len(), error = %e, "malformed packet discarded");
        }

        self.stats.processing_time += started.elapsed();
        result
    }

    fn process_inner(&mut self, data: &[u8], source: SocketAddr, now: Instant) -> Result<Processed> {
        let (header, payload) = decode_message(data)?;
        let body = decode_body(header.kind, payload)?;

        if payload.len() > self.config.max_payload {
            self.stats.oversized += 1;
            warn!(
                device_id = header.device_id,
                seq = header.seq_num,
                bytes = payload.len(),
                limit = self.config.max_payload,
                "oversized payload"
            );
        }

        let ack = header.kind.requires_ack().then(|| AckManager::build_ack(&header));
        let kind = header.kind;
        let seq = header.seq_num;
        let device_id = header.device_id;
        let arrival_unix = unix_now_secs();

        let state = self.devices.entry(device_id).or_insert_with(|| {
            info!(device_id, from = %source, "new device");
            DeviceState::new(device_id, now)
        });
        let prior_last_seq = state.last_seq;

        let duplicate = kind.is_sequenced() && state.seen.contains(&seq);
        let mut classification = Classification {
            duplicate,
            retransmit: duplicate,
            gap: None,
        };

        if !duplicate && !matches!(kind, MessageKind::Batch | MessageKind::Heartbeat) {
            if let Some(last) = prior_last_seq {
                classification.gap = gap_after(last, seq);
            }
        }
        if let Some(gap) = classification.gap {
            self.stats.total_lost += gap as u64;
            warn!(
                device_id,
                gap,
                last_seq = prior_last_seq,
                seq,
                "sequence gap: {} packet(s) missing",
                gap
            );
        }

        if duplicate {
            self.stats.total_duplicates += 1;
        } else {
            if kind == MessageKind::Heartbeat {
                state.heartbeat_count += 1;
            } else {
                state.last_seq = Some(seq);
                state.packet_count += 1;
                state.seen.insert(seq);
            }
            state.last_timestamp = header.timestamp;
            state.last_seen = now;
        }

        let mut records = Vec::new();
        let mut disposition = Disposition::Displayed;

        if duplicate {
            warn!(device_id, seq, kind = %kind, from = %source, "duplicate packet (retransmit)");
            let (kind_label, event_time, readings) = match body {
                Body::Data(reading) => ("DATA", arrival_unix, vec![(seq, reading)]),
                Body::Batch(readings) => (
                    "BATCH_DATA",
                    header.timestamp as u64,
                    readings
                        .iter()
                        .map(|r| (r.seq_num, DataReading { temperature: r.temperature, humidity: r.humidity }))
                        .collect(),
                ),
                Body::Empty => ("", arrival_unix, Vec::new()),
            };
            for (reading_seq, reading) in readings {
                records.push(TelemetryRecord {
                    event_time,
                    device_id,
                    seq_num: reading_seq,
                    kind_label,
                    temperature: reading.temperature,
                    humidity: reading.humidity,
                    duplicate: true,
                    gap: false,
                    retransmit: true,
                    byte_size: data.len(),
                });
            }

            return Ok(Processed {
                header,
                ack,
                classification,
                disposition,
                records,
            });
        }

        match body {
            Body::Data(reading) => {
                debug!(device_id, seq, timestamp = header.timestamp, "DATA buffered for reordering");
                self.reorder.push(BufferedPacket {
                    header,
                    reading,
                    source,
                    buffer_time: now,
                    arrival_unix,
                    byte_size: data.len(),
                    duplicate: false,
                    gap: classification.gap.is_some(),
                    retransmit: false,
                });
                self.stats.total_received += 1;
                disposition = Disposition::Buffered;
            }
            Body::Batch(readings) => {
                info!(device_id, seq, readings = readings.len(), from = %source, "BATCH received");
                let mut high_water = state.last_reading_seq.or(prior_last_seq);
                let mut batch_gap = 0u32;

                for reading in &readings {
                    let gap = high_water.and_then(|last| gap_after(last, reading.seq_num));
                    if let Some(gap) = gap {
                        batch_gap += gap as u32;
                        self.stats.total_lost += gap as u64;
                        warn!(
                            device_id,
                            gap,
                            last_seq = high_water,
                            seq = reading.seq_num,
                            "batch gap: {} reading(s) missing",
                            gap
                        );
                    }
                    info!(
                        device_id,
                        seq = reading.seq_num,
                        temperature = reading.temperature,
                        humidity = reading.humidity,
                        "batch reading"
                    );
                    records.push(TelemetryRecord {
                        event_time: header.timestamp as u64,
                        device_id,
                        seq_num: reading.seq_num,
                        kind_label: "BATCH_DATA",
                        temperature: reading.temperature,
                        humidity: reading.humidity,
                        duplicate: false,
                        gap: gap.is_some(),
                        retransmit: false,
                        byte_size: data.len(),
                    });
                    high_water = Some(high_water.map_or(reading.seq_num, |h| h.max(reading.seq_num)));
                }

                state.last_reading_seq = high_water;
                if batch_gap > 0 {
                    classification.gap = Some(batch_gap.min(u16::MAX as u32) as u16);
                }
                self.stats.total_received += readings.len() as u64;
            }
            Body::Empty => match kind {
                MessageKind::Init => {
                    info!(device_id, seq, from = %source, "INIT: sensor initialized");
                    self.stats.total_received += 1;
                }
                MessageKind::Heartbeat => {
                    info!(device_id, heartbeats = state.heartbeat_count, "HEARTBEAT: device alive");
                    self.stats.total_received += 1;
                }
                other => {
                    info!(device_id, seq, kind = %other, from = %source, "packet with no handler displayed");
                }
            },
        }

        debug!(
            received = self.stats.total_received,
            lost = self.stats.total_lost,
            loss_rate = self.stats.loss_rate(),
            "running totals"
        );

        Ok(Processed {
            header,
            ack,
            classification,
            disposition,
            records,
        })
    }

    /// Release DATA packets whose reorder window has elapsed, in timestamp order
    pub fn sweep(&mut self, now: Instant) -> Vec<TelemetryRecord> {
        let released = self.reorder.release_ready(now);
        if !released.is_empty() {
            info!(count = released.len(), "releasing buffered packets");
        }
        released.into_iter().map(display_released).collect()
    }

    /// Collapse the reorder window and release everything still held
    pub fn flush(&mut self, now: Instant) -> Vec<TelemetryRecord> {
        let released = self.reorder.flush(now);
        if !released.is_empty() {
            info!(count = released.len(), "flushing reorder buffer");
        }
        released.into_iter().map(display_released).collect()
    }

    /// Drop devices with no traffic for longer than the device timeout
    pub fn evict_idle(&mut self, now: Instant) -> Vec<u16> {
        let timeout = self.config.device_timeout;
        let mut evicted = Vec::new();
        self.devices.retain(|&device_id, state| {
            let idle = now.saturating_duration_since(state.last_seen);
            if idle > timeout {
                warn!(device_id, idle_s = idle.as_secs(), "device timed out, marking offline");
                evicted.push(device_id);
                false
            } else {
                true
            }
        });
        evicted
    }
}

fn display_released(packet: BufferedPacket) -> TelemetryRecord {
    info!(
        device_id = packet.header.device_id,
        seq = packet.header.seq_num,
        timestamp = packet.header.timestamp,
        from = %packet.source,
        gap = packet.gap,
        temperature = packet.reading.temperature,
        humidity = packet.reading.humidity,
        "DATA (reordered)"
    );
    TelemetryRecord {
        event_time: packet.arrival_unix,
        device_id: packet.header.device_id,
        seq_num: packet.header.seq_num,
        kind_label: "DATA",
        temperature: packet.reading.temperature,
        humidity: packet.reading.humidity,
        duplicate: packet.duplicate,
        gap: packet.gap,
        retransmit: packet.retransmit,
        byte_size: packet.byte_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_batch, encode_message};

    const DEVICE: u16 = 1001;

    fn source() -> SocketAddr {
        "127.0.0.1:40001".parse().unwrap()
    }

    fn collector() -> Collector {
        Collector::new(CollectorConfig::default())
    }

    fn data(seq: u16, timestamp: u32) -> Vec<u8> {
        let payload = DataReading::rounded(21.5, 50.25).to_json().unwrap();
        encode_message(MessageKind::Data, DEVICE, seq, &payload, Some(timestamp), 0)
    }

    fn control(kind: MessageKind, seq: u16) -> Vec<u8> {
        encode_message(kind, DEVICE, seq, &[], Some(1000), 0)
    }

    fn batch(seqs: &[u16]) -> Vec<u8> {
        let readings: Vec<BatchReading> = seqs
            .iter()
            .map(|&s| BatchReading::new(s, DataReading::rounded(20.0, 40.0)))
            .collect();
        let payload = encode_batch(&readings).unwrap();
        encode_message(MessageKind::Batch, DEVICE, *seqs.last().unwrap(), &payload, Some(1000), 0)
    }

    #[test]
    fn test_duplicate_counted_once() {
        let mut c = collector();
        let now = Instant::now();
        let packet = data(1, 1000);

        let first = c.process_datagram(&packet, source(), now).unwrap();
        assert!(!first.classification.duplicate);
        assert_eq!(first.disposition, Disposition::Buffered);

        let second = c.process_datagram(&packet, source(), now).unwrap();
        assert!(second.classification.duplicate);
        assert!(second.classification.retransmit);
        assert_eq!(second.disposition, Disposition::Displayed);
        assert_eq!(second.records.len(), 1);
        assert!(second.records[0].duplicate);
        assert!(second.ack.is_some());

        assert_eq!(c.device(DEVICE).unwrap().packet_count, 1);
        assert_eq!(c.stats().total_duplicates, 1);
        assert_eq!(c.buffered(), 1);
    }

    #[test]
    fn test_gap_accounting() {
        let mut c = collector();
        let now = Instant::now();
        c.process_datagram(&data(0, 1000), source(), now).unwrap();
        let processed = c.process_datagram(&data(3, 1003), source(), now).unwrap();

        assert_eq!(processed.classification.gap, Some(2));
        assert_eq!(c.stats().total_lost, 2);
        assert_eq!(c.device(DEVICE).unwrap().last_seq, Some(3));
    }

    #[test]
    fn test_ack_only_for_data_and_batch() {
        let mut c = collector();
        let now = Instant::now();

        assert!(c.process_datagram(&control(MessageKind::Init, 0), source(), now).unwrap().ack.is_none());
        assert!(c.process_datagram(&control(MessageKind::Heartbeat, 0), source(), now).unwrap().ack.is_none());

        let ack = c.process_datagram(&data(1, 1000), source(), now).unwrap().ack.unwrap();
        assert_eq!(AckManager::parse_ack(&ack, DEVICE), Some(1));

        let ack = c.process_datagram(&batch(&[2, 3, 4]), source(), now).unwrap().ack.unwrap();
        assert_eq!(AckManager::parse_ack(&ack, DEVICE), Some(4));
    }

    #[test]
    fn test_heartbeat_excluded_from_sequence_bookkeeping() {
        let mut c = collector();
        let now = Instant::now();
        c.process_datagram(&control(MessageKind::Init, 0), source(), now).unwrap();
        c.process_datagram(&control(MessageKind::Heartbeat, 0), source(), now).unwrap();
        let second = c.process_datagram(&control(MessageKind::Heartbeat, 0), source(), now).unwrap();

        assert!(!second.classification.duplicate);
        let state = c.device(DEVICE).unwrap();
        assert_eq!(state.heartbeat_count, 2);
        assert_eq!(state.packet_count, 1);
        assert_eq!(state.last_seq, Some(0));
        assert_eq!(c.stats().total_received, 3);
    }

    #[test]
    fn test_batch_internal_gap() {
        let mut c = collector();
        let now = Instant::now();
        c.process_datagram(&control(MessageKind::Init, 0), source(), now).unwrap();

        let first = c.process_datagram(&batch(&[1, 2, 3]), source(), now).unwrap();
        assert_eq!(first.classification.gap, None);
        assert_eq!(first.records.len(), 3);

        let second = c.process_datagram(&batch(&[4, 7, 8]), source(), now).unwrap();
        assert_eq!(second.classification.gap, Some(2));
        assert!(second.records[1].gap);
        assert_eq!(second.records[1].kind_label, "BATCH_DATA");

        let stats = c.stats();
        assert_eq!(stats.total_lost, 2);
        assert_eq!(stats.total_received, 1 + 3 + 3);
        assert_eq!(c.device(DEVICE).unwrap().last_reading_seq, Some(8));
    }

    #[test]
    fn test_malformed_packets_leave_state_untouched() {
        let mut c = collector();
        let now = Instant::now();

        assert!(c.process_datagram(&[0x11, 0x00, 0x01], source(), now).unwrap_err().is_malformed());
        let bad_json = encode_message(MessageKind::Data, DEVICE, 1, b"temp=20", Some(1), 0);
        assert!(c.process_datagram(&bad_json, source(), now).is_err());

        assert!(c.device(DEVICE).is_none());
        assert_eq!(c.stats().malformed, 2);
        assert_eq!(c.stats().total_received, 0);
    }

    #[test]
    fn test_oversized_payload_accepted() {
        let mut c = collector();
        let seqs: Vec<u16> = (1..=10).collect();
        let packet = batch(&seqs);
        assert!(packet.len() - crate::HEADER_SIZE > crate::MAX_APP_PAYLOAD);

        let processed = c.process_datagram(&packet, source(), Instant::now()).unwrap();
        assert_eq!(processed.records.len(), 10);
        assert_eq!(c.stats().oversized, 1);
    }

    #[test]
    fn test_sweep_releases_in_timestamp_order() {
        let mut c = collector();
        let t0 = Instant::now();
        c.process_datagram(&data(3, 103), source(), t0).unwrap();
        c.process_datagram(&data(1, 101), source(), t0).unwrap();
        c.process_datagram(&data(2, 102), source(), t0).unwrap();

        assert!(c.sweep(t0 + Duration::from_secs(1)).is_empty());
        let seqs: Vec<u16> = c
            .sweep(t0 + Duration::from_secs(2))
            .iter()
            .map(|r| r.seq_num)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_flush_releases_everything() {
        let mut c = collector();
        let t0 = Instant::now();
        c.process_datagram(&data(1, 101), source(), t0).unwrap();
        assert_eq!(c.flush(t0).len(), 1);
        assert_eq!(c.buffered(), 0);
    }

    #[test]
    fn test_idle_device_evicted() {
        let mut c = Collector::new(CollectorConfig::default().with_device_timeout(Duration::from_secs(30)));
        let t0 = Instant::now();
        c.process_datagram(&control(MessageKind::Init, 0), source(), t0).unwrap();

        assert!(c.evict_idle(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(c.evict_idle(t0 + Duration::from_secs(31)), vec![DEVICE]);
        assert!(c.device(DEVICE).is_none());
    }

    #[test]
    fn test_unknown_kind_tracked_but_not_acked() {
        let mut c = collector();
        let packet = control(MessageKind::Unknown(11), 5);
        let processed = c.process_datagram(&packet, source(), Instant::now()).unwrap();
        assert_eq!(processed.header.kind, MessageKind::Unknown(11));
        assert!(processed.ack.is_none());
        assert_eq!(c.device(DEVICE).unwrap().last_seq, Some(5));
    }
}
