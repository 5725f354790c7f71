//! Produce request body decoder.

use crate::codec::Decoder;
use crate::error::Result;
use crate::records::RecordsSummary;

/// Produce request, decoded as far as the probe cares: topic names and
/// per-partition record counts. Record payloads themselves stay on the floor.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    /// Present on v3+ requests from transactional producers.
    pub transactional_id: Option<String>,
    pub required_acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopic>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopic {
    pub name: String,
    pub partitions: Vec<ProducePartition>,
}

#[derive(Debug, Clone)]
pub struct ProducePartition {
    pub index: i32,
    pub records: RecordsSummary,
}

impl ProduceRequest {
    pub(crate) fn decode(d: &mut Decoder<'_>, version: i16) -> Result<Self> {
        let transactional_id = if version >= 3 {
            d.read_nullable_string()?
        } else {
            None
        };
        let required_acks = d.read_i16()?;
        let timeout_ms = d.read_i32()?;

        let topic_count = d.read_array_length()?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            let name = d.read_string()?;
            let partition_count = d.read_array_length()?;
            let mut partitions = Vec::with_capacity(partition_count);
            for _ in 0..partition_count {
                let index = d.read_i32()?;
                let records_size = d.read_i32()?;
                let records = RecordsSummary::decode(d.subset(i64::from(records_size))?)?;
                partitions.push(ProducePartition { index, records });
            }
            topics.push(ProduceTopic { name, partitions });
        }

        Ok(ProduceRequest {
            transactional_id,
            required_acks,
            timeout_ms,
            topics,
        })
    }

    /// Names of the topics this request writes to. Duplicates possible when
    /// a client repeats a topic entry.
    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|t| t.name.as_str())
    }

    /// Total records across all partitions.
    pub fn records_len(&self) -> u64 {
        self.topics
            .iter()
            .flat_map(|t| &t.partitions)
            .map(|p| p.records.records_len)
            .sum()
    }

    /// Total record payload bytes across all partitions, as on the wire.
    pub fn records_size(&self) -> u64 {
        self.topics
            .iter()
            .flat_map(|t| &t.partitions)
            .map(|p| p.records.records_size)
            .sum()
    }
}
