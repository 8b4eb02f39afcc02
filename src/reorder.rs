//! Time-windowed reorder buffer
//!
//! DATA packets are held for a fixed window after arrival. A sweep removes
//! every packet whose window has elapsed and returns them sorted by the
//! header timestamp. Timestamps have one-second resolution, so ties are
//! common; the sort is stable and ties keep arrival order.
//!
//! Ordering holds within one sweep only. A packet that arrives after an
//! earlier sweep released younger packets is still released, just late.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::protocol::{DataReading, Header};

/// A DATA packet parked in the reorder buffer
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedPacket {
    pub header: Header,
    pub reading: DataReading,
    pub source: SocketAddr,
    /// Arrival instant; the window is measured from here
    pub buffer_time: Instant,
    /// Arrival wall-clock time, Unix seconds
    pub arrival_unix: u64,
    pub byte_size: usize,
    pub duplicate: bool,
    pub gap: bool,
    pub retransmit: bool,
}

/// Arrival-ordered hold queue
#[derive(Debug)]
pub struct ReorderBuffer {
    window: Duration,
    packets: Vec<BufferedPacket>,
}

impl ReorderBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            packets: Vec::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Change the hold window. Zero makes every packet eligible immediately.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn push(&mut self, packet: BufferedPacket) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Remove packets held at least `window` and return them in timestamp
    /// order
    pub fn release_ready(&mut self, now: Instant) -> Vec<BufferedPacket> {
        if self.packets.is_empty() {
            return Vec::new();
        }

        let window = self.window;
        let (mut ready, remaining): (Vec<_>, Vec<_>) = self
            .packets
            .drain(..)
            .partition(|p| now.saturating_duration_since(p.buffer_time) >= window);
        self.packets = remaining;

        ready.sort_by_key(|p| p.header.timestamp);
        ready
    }

    /// Collapse the window to zero and release everything
    pub fn flush(&mut self, now: Instant) -> Vec<BufferedPacket> {
        self.window = Duration::ZERO;
        self.release_ready(now)
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::DEFAULT_REORDER_WINDOW_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn packet(seq: u16, timestamp: u32, at: Instant) -> BufferedPacket {
        BufferedPacket {
            header: Header::new(MessageKind::Data, 1, seq, Some(timestamp)),
            reading: DataReading::rounded(20.0, 50.0),
            source: "127.0.0.1:40000".parse().unwrap(),
            buffer_time: at,
            arrival_unix: timestamp as u64,
            byte_size: 48,
            duplicate: false,
            gap: false,
            retransmit: false,
        }
    }

    #[test]
    fn test_release_sorted_by_timestamp() {
        let t0 = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_secs(2));
        buffer.push(packet(3, 103, t0));
        buffer.push(packet(1, 101, t0 + Duration::from_millis(10)));
        buffer.push(packet(2, 102, t0 + Duration::from_millis(20)));

        assert!(buffer.release_ready(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(buffer.len(), 3);

        let released = buffer.release_ready(t0 + Duration::from_secs(3));
        let order: Vec<u32> = released.iter().map(|p| p.header.timestamp).collect();
        assert_eq!(order, vec![101, 102, 103]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_only_aged_packets_released() {
        let t0 = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_secs(2));
        buffer.push(packet(1, 100, t0));
        buffer.push(packet(2, 99, t0 + Duration::from_millis(1500)));

        let released = buffer.release_ready(t0 + Duration::from_secs(2));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].header.seq_num, 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let t0 = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_secs(2));
        buffer.push(packet(5, 200, t0));
        buffer.push(packet(4, 200, t0));
        buffer.push(packet(6, 199, t0));

        let seqs: Vec<u16> = buffer
            .release_ready(t0 + Duration::from_secs(2))
            .iter()
            .map(|p| p.header.seq_num)
            .collect();
        assert_eq!(seqs, vec![6, 5, 4]);
    }

    #[test]
    fn test_flush_ignores_window() {
        let t0 = Instant::now();
        let mut buffer = ReorderBuffer::new(Duration::from_secs(60));
        buffer.push(packet(1, 10, t0));
        buffer.push(packet(2, 9, t0));

        let released = buffer.flush(t0);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].header.seq_num, 2);
        assert_eq!(buffer.window(), Duration::ZERO);
    }
}
