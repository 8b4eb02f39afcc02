//! ACK Manager - acknowledgment and retransmission bookkeeping
//!
//! The sensor keeps every DATA/BATCH packet it has put on the wire in a
//! pending table keyed by sequence number. ACKs remove entries and feed the
//! RTT estimator; a periodic sweep resends anything older than the current
//! RTO and gives up after [`crate::MAX_RETRANSMIT_ATTEMPTS`] resends.
//!
//! The pending table, the estimator and the delivery counters live behind one
//! coarse mutex ([`SharedReliability`]). An RTT sample and a retry bump for the
//! same sequence number are therefore never interleaved. The lock is never
//! held across an `.await`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::protocol::{encode_message, Header, MessageKind};
use crate::rtt::RttEstimator;
use crate::MAX_DATAGRAM_SIZE;

/// An unacknowledged outbound DATA or BATCH packet
#[derive(Debug, Clone)]
pub struct PendingPacket {
    /// Exact bytes that went on the wire; resent unchanged
    pub bytes: Vec<u8>,
    pub destination: SocketAddr,
    /// Time of the most recent transmission
    pub sent_at: Instant,
    /// Resends so far
    pub retries: u32,
}

/// A packet the sweep decided to resend
#[derive(Debug, Clone)]
pub struct Retransmission {
    pub seq_num: u16,
    pub bytes: Vec<u8>,
    pub destination: SocketAddr,
    pub attempt: u32,
}

/// Cumulative sender counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// First transmissions of any kind
    pub sent: u64,
    /// DATA sends suppressed by simulated loss
    pub dropped: u64,
    pub acked: u64,
    pub retransmitted: u64,
    /// Packets that exhausted the retry ceiling
    pub lost: u64,
}

/// Pending table, RTT estimator and counters for one sensor session
#[derive(Debug)]
pub struct ReliabilityState {
    pending: HashMap<u16, PendingPacket>,
    rtt: RttEstimator,
    max_retries: u32,
    stats: DeliveryStats,
    /// Most recent successful first write of a DATA or BATCH packet
    last_data_written: Option<Instant>,
}

/// The single lock shared by the send loop, ACK listener, retransmit timer
/// and jitter tasks
pub type SharedReliability = Arc<Mutex<ReliabilityState>>;

impl ReliabilityState {
    pub fn new(initial_rtt: Duration, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            rtt: RttEstimator::new(initial_rtt),
            max_retries,
            stats: DeliveryStats::default(),
            last_data_written: None,
        }
    }

    /// Wrap in the shared lock
    pub fn shared(self) -> SharedReliability {
        Arc::new(Mutex::new(self))
    }

    /// Track a packet that is about to be written to the socket
    ///
    /// # Arguments
    /// * `seq_num` - Sequence number the ACK will echo
    /// * `bytes` - Exact datagram, resent unchanged on timeout
    /// * `destination` - Collector address
    /// * `now` - Send time; the RTT sample is measured from here
    pub fn register(&mut self, seq_num: u16, bytes: Vec<u8>, destination: SocketAddr, now: Instant) {
        let previous = self.pending.insert(
            seq_num,
            PendingPacket {
                bytes,
                destination,
                sent_at: now,
                retries: 0,
            },
        );
        if previous.is_some() {
            // 16-bit sequence space wrapped while the old packet was in flight
            warn!(seq = seq_num, "pending packet replaced by newer packet with same sequence");
        }
        self.stats.sent += 1;
    }

    /// Forget a packet whose first write failed
    pub fn cancel(&mut self, seq_num: u16) -> Option<PendingPacket> {
        let removed = self.pending.remove(&seq_num);
        if removed.is_some() {
            self.stats.sent = self.stats.sent.saturating_sub(1);
        }
        removed
    }

    /// Note that a DATA or BATCH datagram actually left the socket
    pub fn mark_data_written(&mut self, now: Instant) {
        self.last_data_written = Some(now);
    }

    /// Time of the last DATA or BATCH write; drives the heartbeat deadline
    pub fn last_data_written(&self) -> Option<Instant> {
        self.last_data_written
    }

    /// Count a non-tracked transmission (INIT, HEARTBEAT)
    pub fn record_sent(&mut self) {
        self.stats.sent += 1;
    }

    /// Count a DATA send suppressed by simulated loss
    pub fn record_dropped(&mut self) {
        self.stats.dropped += 1;
    }

    /// Match an ACK against the pending table.
    ///
    /// Returns the RTT sample when `seq_num` was pending. Unmatched ACKs
    /// (late duplicates, already-lost packets) are ignored.
    pub fn on_ack(&mut self, seq_num: u16, now: Instant) -> Option<Duration> {
        let packet = self.pending.remove(&seq_num)?;
        let sample = now.saturating_duration_since(packet.sent_at);
        self.rtt.update(sample);
        self.stats.acked += 1;
        Some(sample)
    }

    /// Collect packets whose age exceeds the RTO.
    ///
    /// Packets below the retry ceiling get their send time reset and retry
    /// count bumped and are returned for resending. Packets at the ceiling are
    /// evicted and counted as lost; they are never resent again.
    pub fn sweep(&mut self, now: Instant) -> Vec<Retransmission> {
        let rto = self.rtt.rto();
        let max_retries = self.max_retries;
        let mut due = Vec::new();
        let mut lost = 0u64;

        self.pending.retain(|&seq_num, packet| {
            if now.saturating_duration_since(packet.sent_at) <= rto {
                return true;
            }
            if packet.retries < max_retries {
                packet.retries += 1;
                packet.sent_at = now;
                due.push(Retransmission {
                    seq_num,
                    bytes: packet.bytes.clone(),
                    destination: packet.destination,
                    attempt: packet.retries,
                });
                true
            } else {
                warn!(seq = seq_num, retries = packet.retries, "packet lost after retry ceiling");
                lost += 1;
                false
            }
        });

        self.stats.retransmitted += due.len() as u64;
        self.stats.lost += lost;
        due
    }

    pub fn is_pending(&self, seq_num: u16) -> bool {
        self.pending.contains_key(&seq_num)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, seq_num: u16) -> Option<&PendingPacket> {
        self.pending.get(&seq_num)
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }
}

/// Lock the shared state, recovering the data if a task panicked while
/// holding it
pub fn lock(state: &SharedReliability) -> MutexGuard<'_, ReliabilityState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// ACK construction and parsing
pub struct AckManager;

impl AckManager {
    /// Build the ACK for a received DATA/BATCH header (collector side).
    ///
    /// Echoes the device id and sequence number; the timestamp is the
    /// collector's clock.
    pub fn build_ack(header: &Header) -> Vec<u8> {
        encode_message(MessageKind::Ack, header.device_id, header.seq_num, &[], None, 0)
    }

    /// Extract the acknowledged sequence number if `datagram` is an ACK for
    /// `device_id` (sensor side)
    pub fn parse_ack(datagram: &[u8], device_id: u16) -> Option<u16> {
        let header = Header::from_bytes(datagram).ok()?;
        if header.kind != MessageKind::Ack {
            return None;
        }
        if header.device_id != device_id {
            debug!(
                expected = device_id,
                got = header.device_id,
                "ignoring ACK addressed to another device"
            );
            return None;
        }
        Some(header.seq_num)
    }
}

/// ACK listener loop.
///
/// Polls the socket with a short timeout; a timeout just means nothing
/// arrived. Exits on a socket error.
pub async fn run_ack_listener(
    socket: Arc<UdpSocket>,
    state: SharedReliability,
    device_id: u16,
    poll_timeout: Duration,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = match time::timeout(poll_timeout, socket.recv_from(&mut buffer)).await {
            Err(_elapsed) => continue,
            Ok(Ok((len, _from))) => len,
            Ok(Err(e)) => {
                error!(error = %e, "ACK listener stopped: receive failed");
                return;
            }
        };

        let Some(seq_num) = AckManager::parse_ack(&buffer[..received], device_id) else {
            continue;
        };

        let mut guard = lock(&state);
        if let Some(sample) = guard.on_ack(seq_num, Instant::now()) {
            let rtt = guard.rtt();
            debug!(
                seq = seq_num,
                sample_ms = sample.as_secs_f64() * 1000.0,
                estimated_ms = rtt.estimated_rtt().as_secs_f64() * 1000.0,
                rto_ms = rtt.rto().as_secs_f64() * 1000.0,
                "ACK received"
            );
        }
    }
}

/// Retransmission timer loop.
///
/// Sweeps the pending table every `period` and resends whatever is due.
/// Exits on a socket error.
pub async fn run_retransmit_timer(socket: Arc<UdpSocket>, state: SharedReliability, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let due = lock(&state).sweep(Instant::now());

        for packet in due {
            if let Err(e) = socket.send_to(&packet.bytes, packet.destination).await {
                error!(error = %e, seq = packet.seq_num, "retransmit timer stopped: send failed");
                return;
            }
            warn!(
                seq = packet.seq_num,
                attempt = packet.attempt,
                bytes = packet.bytes.len(),
                "retransmitted"
            );
        }
    }
}
