//! Decode errors for the Kafka wire protocol.

use thiserror::Error;

/// Result type alias for protocol decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Structured errors surfaced by the wire codec and body decoders.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the field did. Expected for truncated
    /// captures, so callers usually resync rather than abort.
    #[error("insufficient data to decode packet, more bytes expected")]
    InsufficientData,

    #[error("invalid array length")]
    InvalidArrayLength,

    #[error("invalid byteslice length")]
    InvalidByteSliceLength,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("invalid bool")]
    InvalidBool,

    #[error("varint overflow")]
    VarintOverflow,

    #[error("frame not fully consumed: read {consumed} of {len} bytes")]
    TrailingBytes { consumed: usize, len: usize },

    #[error("request of length {0} too large or too small")]
    InvalidFrameSize(i32),

    #[error("unknown records magic byte {0}")]
    UnknownRecordsType(i8),

    #[error("not a kafka request (key {key}, version {version})")]
    UnsupportedProtocol { key: i16, version: i16 },
}
