//! Request framing and body dispatch.
//!
//! A request frame is `[len: i32][key: i16][version: i16][correlation: i32]
//! [client_id: string][body...]` where `len` counts everything after itself.
//! The framer reads the 8-byte prelude, validates it, buffers the rest of the
//! frame and decodes from that buffer, so one frame is always consumed as a
//! unit: exactly `len + 4` bytes from the stream.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{decode_exact, Decoder};
use crate::error::{ProtocolError, Result};
use crate::fetch::FetchRequest;
use crate::produce::ProduceRequest;

/// Maximum size (in bytes) of any request body.
pub const MAX_REQUEST_SIZE: i32 = 100 * 1024 * 1024;

/// Highest api key any Kafka broker dialect assigns. Frames claiming a key
/// above this are not Kafka at all.
const MAX_API_KEY: i16 = 67;

/// Ceiling on plausible api versions, comfortably above anything a 2.4-era
/// client sends.
const MAX_API_VERSION: i16 = 32;

/// Kafka api keys, as of broker 2.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    LeaderAndIsr = 4,
    StopReplica = 5,
    UpdateMetadata = 6,
    ControlledShutdown = 7,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    DescribeGroups = 15,
    ListGroups = 16,
    SaslHandshake = 17,
    ApiVersions = 18,
    CreateTopics = 19,
    DeleteTopics = 20,
    DeleteRecords = 21,
    InitProducerId = 22,
    OffsetForLeaderEpoch = 23,
    AddPartitionsToTxn = 24,
    AddOffsetsToTxn = 25,
    EndTxn = 26,
    WriteTxnMarkers = 27,
    TxnOffsetCommit = 28,
    DescribeAcls = 29,
    CreateAcls = 30,
    DeleteAcls = 31,
    DescribeConfigs = 32,
    AlterConfigs = 33,
    AlterReplicaLogDirs = 34,
    DescribeLogDirs = 35,
    SaslAuthenticate = 36,
    CreatePartitions = 37,
    CreateDelegationToken = 38,
    RenewDelegationToken = 39,
    ExpireDelegationToken = 40,
    DescribeDelegationToken = 41,
    DeleteGroups = 42,
    ElectLeaders = 43,
    IncrementalAlterConfigs = 44,
    AlterPartitionReassignments = 45,
    ListPartitionReassignments = 46,
    OffsetDelete = 47,
}

impl ApiKey {
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(ApiKey::Produce),
            1 => Some(ApiKey::Fetch),
            2 => Some(ApiKey::ListOffsets),
            3 => Some(ApiKey::Metadata),
            4 => Some(ApiKey::LeaderAndIsr),
            5 => Some(ApiKey::StopReplica),
            6 => Some(ApiKey::UpdateMetadata),
            7 => Some(ApiKey::ControlledShutdown),
            8 => Some(ApiKey::OffsetCommit),
            9 => Some(ApiKey::OffsetFetch),
            10 => Some(ApiKey::FindCoordinator),
            11 => Some(ApiKey::JoinGroup),
            12 => Some(ApiKey::Heartbeat),
            13 => Some(ApiKey::LeaveGroup),
            14 => Some(ApiKey::SyncGroup),
            15 => Some(ApiKey::DescribeGroups),
            16 => Some(ApiKey::ListGroups),
            17 => Some(ApiKey::SaslHandshake),
            18 => Some(ApiKey::ApiVersions),
            19 => Some(ApiKey::CreateTopics),
            20 => Some(ApiKey::DeleteTopics),
            21 => Some(ApiKey::DeleteRecords),
            22 => Some(ApiKey::InitProducerId),
            23 => Some(ApiKey::OffsetForLeaderEpoch),
            24 => Some(ApiKey::AddPartitionsToTxn),
            25 => Some(ApiKey::AddOffsetsToTxn),
            26 => Some(ApiKey::EndTxn),
            27 => Some(ApiKey::WriteTxnMarkers),
            28 => Some(ApiKey::TxnOffsetCommit),
            29 => Some(ApiKey::DescribeAcls),
            30 => Some(ApiKey::CreateAcls),
            31 => Some(ApiKey::DeleteAcls),
            32 => Some(ApiKey::DescribeConfigs),
            33 => Some(ApiKey::AlterConfigs),
            34 => Some(ApiKey::AlterReplicaLogDirs),
            35 => Some(ApiKey::DescribeLogDirs),
            36 => Some(ApiKey::SaslAuthenticate),
            37 => Some(ApiKey::CreatePartitions),
            38 => Some(ApiKey::CreateDelegationToken),
            39 => Some(ApiKey::RenewDelegationToken),
            40 => Some(ApiKey::ExpireDelegationToken),
            41 => Some(ApiKey::DescribeDelegationToken),
            42 => Some(ApiKey::DeleteGroups),
            43 => Some(ApiKey::ElectLeaders),
            44 => Some(ApiKey::IncrementalAlterConfigs),
            45 => Some(ApiKey::AlterPartitionReassignments),
            46 => Some(ApiKey::ListPartitionReassignments),
            47 => Some(ApiKey::OffsetDelete),
            _ => None,
        }
    }

    /// Lowercase name used as the `request_type` metric label.
    pub fn name(&self) -> &'static str {
        match self {
            ApiKey::Produce => "produce",
            ApiKey::Fetch => "fetch",
            ApiKey::ListOffsets => "list_offsets",
            ApiKey::Metadata => "metadata",
            ApiKey::LeaderAndIsr => "leader_and_isr",
            ApiKey::StopReplica => "stop_replica",
            ApiKey::UpdateMetadata => "update_metadata",
            ApiKey::ControlledShutdown => "controlled_shutdown",
            ApiKey::OffsetCommit => "offset_commit",
            ApiKey::OffsetFetch => "offset_fetch",
            ApiKey::FindCoordinator => "find_coordinator",
            ApiKey::JoinGroup => "join_group",
            ApiKey::Heartbeat => "heartbeat",
            ApiKey::LeaveGroup => "leave_group",
            ApiKey::SyncGroup => "sync_group",
            ApiKey::DescribeGroups => "describe_groups",
            ApiKey::ListGroups => "list_groups",
            ApiKey::SaslHandshake => "sasl_handshake",
            ApiKey::ApiVersions => "api_versions",
            ApiKey::CreateTopics => "create_topics",
            ApiKey::DeleteTopics => "delete_topics",
            ApiKey::DeleteRecords => "delete_records",
            ApiKey::InitProducerId => "init_producer_id",
            ApiKey::OffsetForLeaderEpoch => "offset_for_leader_epoch",
            ApiKey::AddPartitionsToTxn => "add_partitions_to_txn",
            ApiKey::AddOffsetsToTxn => "add_offsets_to_txn",
            ApiKey::EndTxn => "end_txn",
            ApiKey::WriteTxnMarkers => "write_txn_markers",
            ApiKey::TxnOffsetCommit => "txn_offset_commit",
            ApiKey::DescribeAcls => "describe_acls",
            ApiKey::CreateAcls => "create_acls",
            ApiKey::DeleteAcls => "delete_acls",
            ApiKey::DescribeConfigs => "describe_configs",
            ApiKey::AlterConfigs => "alter_configs",
            ApiKey::AlterReplicaLogDirs => "alter_replica_log_dirs",
            ApiKey::DescribeLogDirs => "describe_log_dirs",
            ApiKey::SaslAuthenticate => "sasl_authenticate",
            ApiKey::CreatePartitions => "create_partitions",
            ApiKey::CreateDelegationToken => "create_delegation_token",
            ApiKey::RenewDelegationToken => "renew_delegation_token",
            ApiKey::ExpireDelegationToken => "expire_delegation_token",
            ApiKey::DescribeDelegationToken => "describe_delegation_token",
            ApiKey::DeleteGroups => "delete_groups",
            ApiKey::ElectLeaders => "elect_leaders",
            ApiKey::IncrementalAlterConfigs => "incremental_alter_configs",
            ApiKey::AlterPartitionReassignments => "alter_partition_reassignments",
            ApiKey::ListPartitionReassignments => "list_partition_reassignments",
            ApiKey::OffsetDelete => "offset_delete",
        }
    }
}

/// Decoded request body, or a marker for the kinds the probe skips.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    /// Unmodelled request kind; the body was discarded unread.
    Opaque { skipped: usize },
}

/// One decoded client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub key: i16,
    pub version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: RequestBody,
}

impl Request {
    pub fn api_key(&self) -> Option<ApiKey> {
        ApiKey::from_i16(self.key)
    }

    /// `request_type` metric label; "unknown" for keys outside the table.
    pub fn request_type(&self) -> &'static str {
        self.api_key().map_or("unknown", |k| k.name())
    }

    /// Decodes everything after key and version from one frame buffer.
    fn decode_body(key: i16, version: i16, d: &mut Decoder<'_>) -> Result<Self> {
        let correlation_id = d.read_i32()?;
        let client_id = d.read_string()?;

        let body = match key {
            0 => RequestBody::Produce(ProduceRequest::decode(d, version)?),
            1 => RequestBody::Fetch(FetchRequest::decode(d, version)?),
            _ => {
                let skipped = d.remaining();
                d.discard(skipped);
                RequestBody::Opaque { skipped }
            }
        };

        Ok(Request {
            key,
            version,
            correlation_id,
            client_id,
            body,
        })
    }
}

/// Errors surfaced by the framer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended on a frame boundary.
    #[error("end of stream")]
    Eof,

    /// The stream ended inside a frame.
    #[error("stream ended mid-frame")]
    UnexpectedEof,

    /// The frame was read but did not decode.
    #[error("decoding request key {key} version {version}: {source}")]
    Decode {
        key: i16,
        version: i16,
        #[source]
        source: ProtocolError,
    },

    #[error("reading stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads and decodes one request frame from `r`.
///
/// On success exactly `len + 4` bytes have been consumed. Frames with an api
/// key or version outside any Kafka dialect fail with
/// [`ProtocolError::UnsupportedProtocol`] before their body is read, so a
/// stream joined mid-frame fails fast instead of swallowing megabytes of
/// phantom body.
pub async fn read_request<R>(r: &mut R) -> std::result::Result<Request, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prelude = [0u8; 8];
    match read_full(r, &mut prelude).await? {
        0 => return Err(FrameError::Eof),
        n if n < prelude.len() => return Err(FrameError::UnexpectedEof),
        _ => {}
    }

    let frame_len = i32::from_be_bytes([prelude[0], prelude[1], prelude[2], prelude[3]]);
    let key = i16::from_be_bytes([prelude[4], prelude[5]]);
    let version = i16::from_be_bytes([prelude[6], prelude[7]]);
    let decode_err = |source| FrameError::Decode {
        key,
        version,
        source,
    };

    if !(0..=MAX_API_KEY).contains(&key) || !(0..=MAX_API_VERSION).contains(&version) {
        return Err(decode_err(ProtocolError::UnsupportedProtocol {
            key,
            version,
        }));
    }

    // The prelude already consumed key and version out of the frame length.
    let body_len = frame_len.wrapping_sub(4);
    if body_len <= 4 || body_len > MAX_REQUEST_SIZE {
        return Err(decode_err(ProtocolError::InvalidFrameSize(body_len)));
    }

    let mut frame = vec![0u8; body_len as usize];
    if read_full(r, &mut frame).await? < frame.len() {
        return Err(FrameError::UnexpectedEof);
    }

    decode_exact(&frame, |d| Request::decode_body(key, version, d)).map_err(decode_err)
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
async fn read_full<R>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_table() {
        assert_eq!(ApiKey::from_i16(0), Some(ApiKey::Produce));
        assert_eq!(ApiKey::from_i16(3), Some(ApiKey::Metadata));
        assert_eq!(ApiKey::from_i16(47), Some(ApiKey::OffsetDelete));
        assert_eq!(ApiKey::from_i16(48), None);
        assert_eq!(ApiKey::from_i16(-1), None);
        assert_eq!(ApiKey::Fetch.name(), "fetch");
    }
}
