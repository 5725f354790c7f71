//! Fetch request body decoder.
//!
//! Decoded only as deeply as needed to name the topics a consumer asks for;
//! every field is still consumed so the frame accounting stays exact.

use crate::codec::Decoder;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    /// v3+; earlier versions have no response size cap.
    pub max_bytes: i32,
    /// v4+.
    pub isolation_level: i8,
    /// v7+ incremental fetch sessions.
    pub session_id: i32,
    pub session_epoch: i32,
    pub topics: Vec<FetchTopic>,
}

#[derive(Debug, Clone)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: i32,
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

impl FetchRequest {
    pub(crate) fn decode(d: &mut Decoder<'_>, version: i16) -> Result<Self> {
        let replica_id = d.read_i32()?;
        let max_wait_ms = d.read_i32()?;
        let min_bytes = d.read_i32()?;
        let max_bytes = if version >= 3 { d.read_i32()? } else { i32::MAX };
        let isolation_level = if version >= 4 { d.read_i8()? } else { 0 };
        let session_id = if version >= 7 { d.read_i32()? } else { 0 };
        let session_epoch = if version >= 7 { d.read_i32()? } else { -1 };

        let topic_count = d.read_array_length()?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = d.read_string()?;
            let partition_count = d.read_array_length()?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let partition = d.read_i32()?;
                let current_leader_epoch = if version >= 9 { d.read_i32()? } else { -1 };
                let fetch_offset = d.read_i64()?;
                let log_start_offset = if version >= 5 { d.read_i64()? } else { -1 };
                let partition_max_bytes = d.read_i32()?;
                partitions.push(FetchPartition {
                    partition,
                    current_leader_epoch,
                    fetch_offset,
                    log_start_offset,
                    partition_max_bytes,
                });
            }
            topics.push(FetchTopic { name, partitions });
        }

        // Session forget-list and rack id trail the topics on newer
        // versions. Not observations, but the frame must be drained.
        if version >= 7 {
            let forgotten_count = d.read_array_length()?;
            for _ in 0..forgotten_count {
                let _topic = d.read_string()?;
                let _partitions = d.read_i32_array()?;
            }
        }
        if version >= 11 {
            let _rack_id = d.read_string()?;
        }

        Ok(FetchRequest {
            replica_id,
            max_wait_ms,
            min_bytes,
            max_bytes,
            isolation_level,
            session_id,
            session_epoch,
            topics,
        })
    }

    /// Names of the topics this consumer is fetching.
    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|t| t.name.as_str())
    }
}
