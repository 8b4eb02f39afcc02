//! Wire codec for TinyTelemetry v1
//!
//! Header layout (10 bytes, network byte order):
//!
//! ```text
//! +---------+----------+--------+-----------+-------+
//! | Ver|Kind| DeviceID | SeqNum | Timestamp | Flags |
//! |  (1B)   |   (2B)   |  (2B)  |   (4B)    | (1B)  |
//! +---------+----------+--------+-----------+-------+
//! ```
//!
//! The first byte is `(version << 4) | kind`. Everything after the header is
//! payload: empty for INIT/HEARTBEAT/ACK, a JSON object for DATA and a JSON
//! array of readings for BATCH.
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TelemetryError};
use crate::{HEADER_SIZE, PROTOCOL_VERSION};

/// Message kind carried in the low nibble of the first header byte
///
/// Codes outside the known set are kept as [`MessageKind::Unknown`] so that
/// newer peers are not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Init,
    Data,
    Heartbeat,
    Batch,
    Ack,
    Unknown(u8),
}

impl MessageKind {
    /// Map a 4-bit code to a kind. Bits above the low nibble are ignored.
    pub fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0 => Self::Init,
            1 => Self::Data,
            2 => Self::Heartbeat,
            3 => Self::Batch,
            4 => Self::Ack,
            other => Self::Unknown(other),
        }
    }

    /// Numeric wire code
    pub fn code(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Data => 1,
            Self::Heartbeat => 2,
            Self::Batch => 3,
            Self::Ack => 4,
            Self::Unknown(code) => code & 0x0F,
        }
    }

    /// Kinds that take part in sequence bookkeeping
    pub fn is_sequenced(self) -> bool {
        !matches!(self, Self::Heartbeat)
    }

    /// Kinds the collector must acknowledge
    pub fn requires_ack(self) -> bool {
        matches!(self, Self::Data | Self::Batch)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("INIT"),
            Self::Data => f.write_str("DATA"),
            Self::Heartbeat => f.write_str("HEARTBEAT"),
            Self::Batch => f.write_str("BATCH"),
            Self::Ack => f.write_str("ACK"),
            Self::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// Diagnostic name for a raw kind code, e.g. `"DATA"` or `"UNKNOWN(9)"`
pub fn kind_to_string(code: u8) -> String {
    MessageKind::from_code(code).to_string()
}

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: MessageKind,
    pub device_id: u16,
    pub seq_num: u16,
    /// Unix seconds
    pub timestamp: u32,
    pub flags: u8,
}

impl Header {
    /// Build a current-version header. `timestamp` defaults to now.
    pub fn new(kind: MessageKind, device_id: u16, seq_num: u16, timestamp: Option<u32>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            device_id,
            seq_num,
            timestamp: timestamp.unwrap_or_else(unix_now),
            flags: 0,
        }
    }

    /// Build a header from wider integers, rejecting anything that does not
    /// fit in 16 bits instead of truncating it.
    pub fn try_new(
        kind: MessageKind,
        device_id: u32,
        seq_num: u32,
        timestamp: Option<u32>,
        flags: u8,
    ) -> Result<Self> {
        let device_id = u16::try_from(device_id).map_err(|_| TelemetryError::FieldOutOfRange {
            field: "device_id",
            value: device_id as u64,
        })?;
        let seq_num = u16::try_from(seq_num).map_err(|_| TelemetryError::FieldOutOfRange {
            field: "seq_num",
            value: seq_num as u64,
        })?;
        let mut header = Self::new(kind, device_id, seq_num, timestamp);
        header.flags = flags;
        Ok(header)
    }

    /// Serialize to the fixed 10-byte layout
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = ((self.version & 0x0F) << 4) | self.kind.code();
        out[1..3].copy_from_slice(&self.device_id.to_be_bytes());
        out[3..5].copy_from_slice(&self.seq_num.to_be_bytes());
        out[5..9].copy_from_slice(&self.timestamp.to_be_bytes());
        out[9] = self.flags;
        out
    }

    /// Parse the first 10 bytes of `data`.
    ///
    /// The version nibble is reported as-is and never checked against a
    /// supported set.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(TelemetryError::InvalidPacketLength {
                expected: HEADER_SIZE,
                received: data.len(),
            });
        }

        Ok(Self {
            version: data[0] >> 4,
            kind: MessageKind::from_code(data[0]),
            device_id: u16::from_be_bytes([data[1], data[2]]),
            seq_num: u16::from_be_bytes([data[3], data[4]]),
            timestamp: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
            flags: data[9],
        })
    }
}

/// Current Unix time in whole seconds
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// Encode a header for `kind`
pub fn encode_header(
    kind: MessageKind,
    device_id: u16,
    seq_num: u16,
    timestamp: Option<u32>,
    flags: u8,
) -> [u8; HEADER_SIZE] {
    let mut header = Header::new(kind, device_id, seq_num, timestamp);
    header.flags = flags;
    header.to_bytes()
}

/// Decode the header at the front of `data`
pub fn decode_header(data: &[u8]) -> Result<Header> {
    Header::from_bytes(data)
}

/// Encode a complete message: header followed by `payload`
///
/// # Arguments
/// * `kind` - Message kind for the low nibble of byte 0
/// * `device_id` - Sending device
/// * `seq_num` - Sequence number (HEARTBEAT always uses 0)
/// * `payload` - Kind-specific body, may be empty
/// * `timestamp` - Unix seconds; `None` stamps the current time
/// * `flags` - Reserved flag byte
///
/// # Returns
/// `HEADER_SIZE + payload.len()` bytes ready for the socket
pub fn encode_message(
    kind: MessageKind,
    device_id: u16,
    seq_num: u16,
    payload: &[u8],
    timestamp: Option<u32>,
    flags: u8,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&encode_header(kind, device_id, seq_num, timestamp, flags));
    out.extend_from_slice(payload);
    out
}

/// Split a datagram into its header and the (possibly empty) payload
pub fn decode_message(data: &[u8]) -> Result<(Header, &[u8])> {
    let header = Header::from_bytes(data)?;
    Ok((header, &data[HEADER_SIZE..]))
}

/// DATA payload: one reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataReading {
    pub temperature: f64,
    pub humidity: f64,
}

impl DataReading {
    /// Reading rounded to two decimal places, as sent on the wire
    pub fn rounded(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature: round2(temperature),
            humidity: round2(humidity),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TelemetryError::SerializationError(e.to_string()))
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// One element of a BATCH payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchReading {
    #[serde(rename = "seqNum", alias = "seq_num")]
    pub seq_num: u16,
    pub temperature: f64,
    pub humidity: f64,
}

impl BatchReading {
    pub fn new(seq_num: u16, reading: DataReading) -> Self {
        Self {
            seq_num,
            temperature: reading.temperature,
            humidity: reading.humidity,
        }
    }
}

/// Encode a BATCH payload
pub fn encode_batch(readings: &[BatchReading]) -> Result<Vec<u8>> {
    serde_json::to_vec(readings).map_err(|e| TelemetryError::SerializationError(e.to_string()))
}

/// Decode a BATCH payload
pub fn decode_batch(payload: &[u8]) -> Result<Vec<BatchReading>> {
    Ok(serde_json::from_slice(payload)?)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
