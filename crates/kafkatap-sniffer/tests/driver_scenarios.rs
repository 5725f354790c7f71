//! End-to-end scenarios: bytes in through a flow handle, series out of the
//! relation registry.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kafkatap_common::FlowKey;
use kafkatap_monitoring::RelationRegistry;
use kafkatap_protocol::Encoder;
use kafkatap_sniffer::assembly::StreamFactory;
use kafkatap_sniffer::capture::Segment;
use kafkatap_sniffer::reassembly::Assembler;

const EXPIRE: Duration = Duration::from_secs(300);

fn flow(client: &str) -> FlowKey {
    FlowKey::new(client.parse().unwrap(), 34712, "10.0.0.9".parse().unwrap(), 9092)
}

fn series_value(registry: &RelationRegistry, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    registry
        .gather()
        .into_iter()
        .find(|mf| mf.get_name() == name)?
        .get_metric()
        .iter()
        .find(|m| {
            labels.iter().all(|(key, value)| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == *key && l.get_value() == *value)
            })
        })
        .map(|m| m.get_gauge().get_value())
}

fn series_count(registry: &RelationRegistry, name: &str) -> usize {
    registry
        .gather()
        .into_iter()
        .find(|mf| mf.get_name() == name)
        .map_or(0, |mf| mf.get_metric().len())
}

fn frame(key: i16, version: i16, correlation_id: i32, client_id: &str, body: &[u8]) -> BytesMut {
    let mut payload = BytesMut::new();
    let mut e = Encoder::new(&mut payload);
    e.write_i16(key);
    e.write_i16(version);
    e.write_i32(correlation_id);
    e.write_string(client_id);
    e.write_raw_bytes(body);

    let mut out = BytesMut::new();
    let mut e = Encoder::new(&mut out);
    e.write_i32(payload.len() as i32);
    e.write_raw_bytes(&payload);
    out
}

fn record_batch(record_count: i32, records: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut e = Encoder::new(&mut buf);
    e.write_i64(0);
    e.write_i32(49 + records.len() as i32);
    e.write_i32(-1);
    e.write_i8(2); // magic
    e.write_i32(0);
    e.write_i16(0);
    e.write_i32(record_count - 1);
    e.write_i64(0);
    e.write_i64(0);
    e.write_i64(-1);
    e.write_i16(-1);
    e.write_i32(-1);
    e.write_i32(record_count);
    e.write_raw_bytes(records);
    buf
}

fn produce_frame(client_id: &str, topic: &str) -> BytesMut {
    let records = record_batch(1, b"one-record");
    let mut body = BytesMut::new();
    let mut e = Encoder::new(&mut body);
    e.write_nullable_string(None); // transactional id
    e.write_i16(1); // acks
    e.write_i32(10_000); // timeout
    e.write_array_length(1);
    e.write_string(topic);
    e.write_array_length(1);
    e.write_i32(0);
    e.write_i32(records.len() as i32);
    e.write_raw_bytes(&records);
    frame(0, 3, 132, client_id, &body)
}

fn fetch_frame(client_id: &str, topics: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    let mut e = Encoder::new(&mut body);
    e.write_i32(-1); // replica id
    e.write_i32(500);
    e.write_i32(1);
    e.write_i32(52_428_800); // max bytes (v3+)
    e.write_i8(0); // isolation (v4)
    e.write_array_length(topics.len());
    for topic in topics {
        e.write_string(topic);
        e.write_array_length(1);
        e.write_i32(0);
        e.write_i64(42);
        e.write_i32(1_048_576);
    }
    frame(1, 4, 7, client_id, &body)
}

#[tokio::test]
async fn produce_registers_producer_relation() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let factory = StreamFactory::new(Arc::clone(&registry));

    let mut handle = factory.open(flow("10.0.0.1"));
    handle.push(&produce_frame("sarama", "mytopic")).await.unwrap();
    handle.close().await;

    assert_eq!(
        series_value(
            &registry,
            "kafkatap_producer_topic_relation_info",
            &[("client_ip", "10.0.0.1"), ("topic", "mytopic")],
        ),
        Some(1.0)
    );
    assert_eq!(
        series_value(
            &registry,
            "kafkatap_active_connections_total",
            &[("client_ip", "10.0.0.1")],
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn fetch_registers_consumer_relations() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let factory = StreamFactory::new(Arc::clone(&registry));

    let mut handle = factory.open(flow("10.0.0.2"));
    handle.push(&fetch_frame("consumer-1", &["t1", "t2"])).await.unwrap();
    handle.close().await;

    for topic in ["t1", "t2"] {
        assert_eq!(
            series_value(
                &registry,
                "kafkatap_consumer_topic_relation_info",
                &[("client_ip", "10.0.0.2"), ("topic", topic)],
            ),
            Some(1.0),
            "topic {topic}"
        );
    }
}

#[tokio::test]
async fn unknown_request_kind_is_skipped_not_fatal() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let factory = StreamFactory::new(Arc::clone(&registry));

    let mut handle = factory.open(flow("10.0.0.1"));
    // A metadata request the probe does not model...
    handle.push(&frame(3, 9, 55, "adm", &[0u8; 32])).await.unwrap();
    // ...followed in the same stream by a produce request.
    handle.push(&produce_frame("adm", "after")).await.unwrap();
    handle.close().await;

    assert_eq!(
        series_count(&registry, "kafkatap_producer_topic_relation_info"),
        1
    );
    assert_eq!(
        series_value(
            &registry,
            "kafkatap_producer_topic_relation_info",
            &[("client_ip", "10.0.0.1"), ("topic", "after")],
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn truncated_frame_registers_nothing() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let factory = StreamFactory::new(Arc::clone(&registry));

    let mut handle = factory.open(flow("10.0.0.1"));
    // Declared length 1000, only 300 bytes ever arrive.
    let mut bytes = frame(0, 3, 1, "c", &[0u8; 992]);
    bytes.truncate(300);
    handle.push(&bytes).await.unwrap();
    handle.close().await;

    assert_eq!(
        series_count(&registry, "kafkatap_producer_topic_relation_info"),
        0
    );
    assert_eq!(
        series_count(&registry, "kafkatap_consumer_topic_relation_info"),
        0
    );
}

#[tokio::test]
async fn garbage_resyncs_to_the_next_valid_frame() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let factory = StreamFactory::new(Arc::clone(&registry));

    let mut handle = factory.open(flow("10.0.0.1"));
    // A stream joined mid-frame: leftover bytes of some previous frame,
    // then a clean produce request.
    handle.push(&[0xde, 0xad, 0xbe, 0xef, 0xff, 0x13, 0x88, 0x9c]).await.unwrap();
    handle.push(&produce_frame("sarama", "recovered")).await.unwrap();
    handle.close().await;

    assert_eq!(
        series_value(
            &registry,
            "kafkatap_producer_topic_relation_info",
            &[("client_ip", "10.0.0.1"), ("topic", "recovered")],
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn random_bytes_never_register_topics() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let factory = StreamFactory::new(Arc::clone(&registry));

    // Deterministic pseudo-random stream.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut noise = Vec::with_capacity(4096);
    for _ in 0..4096 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        noise.push(state as u8);
    }

    let mut handle = factory.open(flow("10.0.0.66"));
    handle.push(&noise).await.unwrap();
    handle.close().await;

    assert_eq!(
        series_count(&registry, "kafkatap_producer_topic_relation_info"),
        0
    );
    assert_eq!(
        series_count(&registry, "kafkatap_consumer_topic_relation_info"),
        0
    );
}

#[tokio::test]
async fn out_of_order_segments_reassemble() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));
    let mut assembler = Assembler::new(StreamFactory::new(Arc::clone(&registry)));

    let bytes = produce_frame("sarama", "reordered");
    let (first, rest) = bytes.split_at(10);
    let (second, third) = rest.split_at(rest.len() / 2);
    let base = 1_000u32;
    let key = flow("10.0.0.3");

    let segment = |seq: u32, payload: &[u8], fin: bool| Segment {
        flow: key,
        seq,
        payload: Bytes::copy_from_slice(payload),
        syn: false,
        fin,
        rst: false,
    };

    assembler.feed(segment(base, first, false)).await;
    // The third chunk arrives early and parks until the second fills the gap.
    assembler
        .feed(segment(base + (first.len() + second.len()) as u32, third, false))
        .await;
    assembler
        .feed(segment(base + first.len() as u32, second, false))
        .await;
    // A full retransmission of the second chunk changes nothing.
    assembler
        .feed(segment(base + first.len() as u32, second, false))
        .await;
    assembler
        .feed(segment(base + bytes.len() as u32, &[], true))
        .await;

    assert_eq!(assembler.flow_count(), 0);
    assert_eq!(
        series_value(
            &registry,
            "kafkatap_producer_topic_relation_info",
            &[("client_ip", "10.0.0.3"), ("topic", "reordered")],
        ),
        Some(1.0)
    );
}
