//! TinyTelemetry - reliable sensor telemetry over UDP
//!
//! A miniature reliable-data-transfer protocol that carries periodic sensor
//! readings from many devices to a single collector.
//!
//! # Layers
//! - [`protocol`]: 10-byte big-endian header plus a kind-dependent JSON payload
//! - [`transmitter`] + [`ack_manager`] + [`rtt`]: sensor side. Sequence numbers,
//!   batching, loss/jitter injection, pending-packet tracking and adaptive
//!   retransmission driven by a TCP-style RTT estimator
//! - [`receiver`] + [`reorder`] + [`collector`]: collector side. Per-device state,
//!   duplicate/gap detection, ACK emission and a time-windowed reorder buffer
//! - [`sink`] and [`monitor`]: the CSV log and process metrics collaborators

pub mod errors;
pub mod protocol;
pub mod rtt;
pub mod ack_manager;
pub mod transmitter;
pub mod reorder;
pub mod receiver;
pub mod collector;
pub mod sink;
pub mod monitor;

pub use errors::{Result, TelemetryError};
pub use protocol::{BatchReading, DataReading, Header, MessageKind};

/// Protocol version carried in the high nibble of the first header byte
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 10;

/// Application payload ceiling (bytes after the header)
///
/// Batches are split to stay under it; the collector accepts larger
/// payloads but logs them as oversized.
pub const MAX_APP_PAYLOAD: usize = 200;

/// Receive buffer size for a single datagram
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Retransmissions allowed before a packet is declared lost
pub const MAX_RETRANSMIT_ATTEMPTS: u32 = 3;

/// EWMA gain for the smoothed RTT
pub const RTT_ALPHA: f64 = 0.125;

/// EWMA gain for the RTT deviation
pub const RTT_BETA: f64 = 0.25;

/// Period of the sender's retransmission sweep in milliseconds
pub const RETRANSMIT_SWEEP_MS: u64 = 100;

/// Receive timeout used by the sender's ACK listener in milliseconds
pub const ACK_POLL_TIMEOUT_MS: u64 = 100;

/// Quiet interval after which the sensor emits a heartbeat, in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// How long a DATA packet is held in the reorder buffer, in seconds
pub const DEFAULT_REORDER_WINDOW_SECS: u64 = 2;

/// Reorder buffer sweep period under continuous load, in seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3;

/// Bounded wait of the collector's receive loop, in seconds
pub const DEFAULT_RECV_TIMEOUT_SECS: u64 = 5;

/// Idle time after which a device is evicted, in seconds
pub const DEFAULT_DEVICE_TIMEOUT_SECS: u64 = 30;

/// Default collector port
pub const DEFAULT_PORT: u16 = 5000;
