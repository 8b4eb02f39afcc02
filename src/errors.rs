//! Error types for TinyTelemetry operations
//!
//! Packet-level problems (truncated header, bad JSON) are recoverable: the
//! collector drops the datagram and keeps going. Transport failures are
//! fatal to whichever side hits them.
use std::fmt;
use std::io;

/// Result type alias for TinyTelemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// TinyTelemetry error enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// I/O error (socket bind, send or receive failure)
    IoError(String),

    /// Fewer bytes than the fixed header requires
    InvalidPacketLength { expected: usize, received: usize },

    /// A numeric field does not fit its wire width
    FieldOutOfRange { field: &'static str, value: u64 },

    /// Payload failed kind-specific decoding
    DeserializationError(String),

    /// Payload could not be encoded
    SerializationError(String),

    /// Configuration value rejected before any socket is opened
    InvalidConfig(String),
}

impl TelemetryError {
    /// True for errors that concern a single malformed packet.
    ///
    /// These are logged and the packet discarded; they never stop a loop.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::InvalidPacketLength { .. } | Self::DeserializationError(_)
        )
    }
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(msg) => write!(f, "I/O error: {}", msg),
            Self::InvalidPacketLength { expected, received } => {
                write!(f, "Invalid packet length: need {} bytes, received {}", expected, received)
            }
            Self::FieldOutOfRange { field, value } => {
                write!(f, "Field {} out of range: {}", field, value)
            }
            Self::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for TelemetryError {}

impl From<io::Error> for TelemetryError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::IoError(err.to_string())
        } else {
            Self::DeserializationError(err.to_string())
        }
    }
}
