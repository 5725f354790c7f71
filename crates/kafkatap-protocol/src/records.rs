//! Record payload summaries.
//!
//! Produce bodies carry record blobs in one of two historical container
//! formats, discriminated by the magic byte at offset 16: the legacy
//! MessageSet (magic 0 and 1) and the v2 RecordBatch. The probe only needs
//! counts, so neither format is decoded past its headers and payloads are
//! never decompressed.

use crate::codec::Decoder;
use crate::error::{ProtocolError, Result};

/// Offset of the magic byte within a records blob. Works for both container
/// formats: MessageSet = offset(8) size(4) crc(4) magic, RecordBatch =
/// base_offset(8) batch_length(4) partition_leader_epoch(4) magic.
const MAGIC_OFFSET: usize = 16;

/// Counts extracted from one partition's records blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordsSummary {
    /// Number of records (legacy: messages) the blob declares.
    pub records_len: u64,
    /// Bytes of record payload, compressed as seen on the wire.
    pub records_size: u64,
}

impl RecordsSummary {
    /// Summarises a records blob. The decoder must span exactly the blob.
    ///
    /// Blobs shorter than the magic offset cannot be classified and fail
    /// with `InsufficientData`. A blob that classifies but whose interior
    /// does not parse (exotic compression layouts, mid-batch corruption) is
    /// credited as opaque: zero records, the outer size in bytes.
    pub fn decode(mut d: Decoder<'_>) -> Result<Self> {
        let outer_size = d.remaining() as u64;
        let magic = d.peek_i8(MAGIC_OFFSET)?;

        let parsed = if magic < 2 {
            message_set_summary(&mut d)
        } else {
            record_batch_summary(&mut d)
        };

        Ok(parsed.unwrap_or(RecordsSummary {
            records_len: 0,
            records_size: outer_size,
        }))
    }
}

/// Legacy MessageSet: a bare concatenation of
/// `offset(8) message_size(4) crc(4) magic(1) attributes(1)
/// [timestamp(8) if magic==1] key(bytes) value(bytes)` entries.
/// Brokers may truncate the final entry, so a short tail ends the count
/// instead of failing.
fn message_set_summary(d: &mut Decoder<'_>) -> Result<RecordsSummary> {
    let mut summary = RecordsSummary::default();

    while d.remaining() > 0 {
        if d.remaining() < 12 {
            break;
        }
        let _offset = d.read_i64()?;
        let message_size = d.read_i32()?;
        if message_size < 0 {
            return Err(ProtocolError::InvalidByteSliceLength);
        }
        if message_size as usize > d.remaining() {
            // Partial trailing message.
            break;
        }

        let mut message = d.subset(i64::from(message_size))?;
        let _crc = message.read_i32()?;
        let magic = message.read_i8()?;
        if !(0..=1).contains(&magic) {
            return Err(ProtocolError::UnknownRecordsType(magic));
        }
        let _attributes = message.read_i8()?;
        if magic == 1 {
            let _timestamp = message.read_i64()?;
        }
        let _key = message.read_bytes()?;
        let value = message.read_bytes()?;

        summary.records_len += 1;
        summary.records_size += value.map_or(0, |v| v.len()) as u64;
    }

    Ok(summary)
}

/// RecordBatch v2: a 61-byte header carrying the record count, followed by
/// the (possibly compressed) records area.
fn record_batch_summary(d: &mut Decoder<'_>) -> Result<RecordsSummary> {
    let _base_offset = d.read_i64()?;
    let _batch_length = d.read_i32()?;
    let _partition_leader_epoch = d.read_i32()?;
    let magic = d.read_i8()?;
    if magic != 2 {
        return Err(ProtocolError::UnknownRecordsType(magic));
    }
    let _crc = d.read_i32()?;
    let _attributes = d.read_i16()?;
    let _last_offset_delta = d.read_i32()?;
    let _base_timestamp = d.read_i64()?;
    let _max_timestamp = d.read_i64()?;
    let _producer_id = d.read_i64()?;
    let _producer_epoch = d.read_i16()?;
    let _base_sequence = d.read_i32()?;
    let record_count = d.read_i32()?;
    if record_count < 0 {
        return Err(ProtocolError::InvalidArrayLength);
    }

    Ok(RecordsSummary {
        records_len: record_count as u64,
        records_size: d.remaining() as u64,
    })
}
