//! Relation metrics with idle expiry.
//!
//! Discovered relations are exposed as labeled gauges that disappear once a
//! relation goes quiet: each label tuple carries a deadline, every
//! observation pushes the deadline out, and a one-shot task per live tuple
//! removes the series and the table entry together when the deadline
//! passes. Evicted tuples are reported on a bounded channel consumed by one
//! task per metric; a full channel drops the notification, never blocks the
//! eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

const NAMESPACE: &str = "kafkatap";

/// Relation idle TTL applied when none is configured.
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(5 * 60);

/// Backlog of eviction notifications per metric.
const EVICTION_CHANNEL_CAPACITY: usize = 1024;

/// One labeled gauge whose series expire after `expire_time` without an
/// observation.
struct ExpiringGaugeVec {
    gauge: GaugeVec,
    expire_time: Duration,
    /// Deadline per live label tuple. Gauge and table mutate under this
    /// lock only, so a series is exposed exactly while its entry lives.
    deadlines: Arc<Mutex<HashMap<Vec<String>, Instant>>>,
    evicted_tx: mpsc::Sender<Vec<String>>,
    evictions_dropped: IntCounter,
}

impl ExpiringGaugeVec {
    fn new(
        registry: &Registry,
        name: &str,
        help: &str,
        labels: &[&str],
        expire_time: Duration,
        evictions: IntCounter,
        evictions_dropped: IntCounter,
    ) -> Self {
        let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels).unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();

        let (evicted_tx, mut evicted_rx) = mpsc::channel::<Vec<String>>(EVICTION_CHANNEL_CAPACITY);
        let metric = name.to_owned();
        tokio::spawn(async move {
            while let Some(labels) = evicted_rx.recv().await {
                debug!(metric = %metric, labels = ?labels, "relation expired");
                evictions.inc();
            }
        });

        Self {
            gauge,
            expire_time,
            deadlines: Arc::new(Mutex::new(HashMap::new())),
            evicted_tx,
            evictions_dropped,
        }
    }

    /// Records an observation for `labels`: refreshes the deadline, arms an
    /// expiry task on first sight, and either pins the series at 1 or
    /// increments it.
    fn touch(&self, labels: Vec<String>, increment: bool) {
        let deadline = Instant::now() + self.expire_time;
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();

        let mut deadlines = self.deadlines.lock().unwrap();
        if increment {
            self.gauge.with_label_values(&label_refs).inc();
        } else {
            self.gauge.with_label_values(&label_refs).set(1.0);
        }
        if deadlines.insert(labels.clone(), deadline).is_none() {
            tokio::spawn(expire_after(
                self.gauge.clone(),
                Arc::clone(&self.deadlines),
                self.evicted_tx.clone(),
                self.evictions_dropped.clone(),
                labels,
                deadline,
            ));
        }
    }
}

/// One-shot expiry for one label tuple. Sleeps to the deadline, re-reads it
/// under the lock, and keeps sleeping while observations push it out. A
/// refresh racing the wakeup therefore wins; once the deadline is truly in
/// the past the entry and the exposed series go together.
async fn expire_after(
    gauge: GaugeVec,
    deadlines: Arc<Mutex<HashMap<Vec<String>, Instant>>>,
    evicted_tx: mpsc::Sender<Vec<String>>,
    evictions_dropped: IntCounter,
    labels: Vec<String>,
    mut deadline: Instant,
) {
    loop {
        tokio::time::sleep_until(deadline).await;
        {
            let mut map = deadlines.lock().unwrap();
            let current = match map.get(&labels) {
                None => return,
                Some(current) => *current,
            };
            if current > Instant::now() {
                deadline = current;
                continue;
            }
            map.remove(&labels);
            let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _ = gauge.remove_label_values(&label_refs);
        }
        if evicted_tx.try_send(labels).is_err() {
            evictions_dropped.inc();
        }
        return;
    }
}

/// Everything the probe exposes: the expiring relation gauges plus plain
/// per-client counters.
pub struct RelationRegistry {
    registry: Registry,
    producer_topics: ExpiringGaugeVec,
    consumer_topics: ExpiringGaugeVec,
    active_connections: ExpiringGaugeVec,
    typed_requests: IntCounterVec,
    producer_batch_length: IntCounterVec,
    producer_batch_size: IntCounterVec,
}

impl RelationRegistry {
    /// Builds the registry and spawns its eviction consumers; call from
    /// within a tokio runtime.
    pub fn new(expire_time: Duration) -> Self {
        let registry = Registry::new();

        let evictions = IntCounterVec::new(
            Opts::new(
                "relation_evictions_total",
                "Relations evicted after their idle TTL",
            )
            .namespace(NAMESPACE),
            &["metric"],
        )
        .unwrap();
        registry.register(Box::new(evictions.clone())).unwrap();

        let evictions_dropped = IntCounter::with_opts(
            Opts::new(
                "relation_evictions_dropped_total",
                "Eviction notifications dropped on a full channel",
            )
            .namespace(NAMESPACE),
        )
        .unwrap();
        registry
            .register(Box::new(evictions_dropped.clone()))
            .unwrap();

        let expiring = |name: &str, help: &str, labels: &[&str]| {
            ExpiringGaugeVec::new(
                &registry,
                name,
                help,
                labels,
                expire_time,
                evictions.with_label_values(&[name]),
                evictions_dropped.clone(),
            )
        };

        let producer_topics = expiring(
            "producer_topic_relation_info",
            "Relation information between producer and topic",
            &["client_ip", "topic"],
        );
        let consumer_topics = expiring(
            "consumer_topic_relation_info",
            "Relation information between consumer and topic",
            &["client_ip", "topic"],
        );
        let active_connections = expiring(
            "active_connections_total",
            "Client connections to the broker seen by the probe",
            &["client_ip"],
        );

        let counter = |name: &str, help: &str, labels: &[&str]| {
            let c =
                IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels).unwrap();
            registry.register(Box::new(c.clone())).unwrap();
            c
        };

        let typed_requests = counter(
            "typed_requests_total",
            "Total requests to kafka by type",
            &["client_ip", "request_type"],
        );
        let producer_batch_length = counter(
            "producer_batch_length",
            "Length of producer request batch to kafka",
            &["client_ip"],
        );
        let producer_batch_size = counter(
            "producer_batch_size",
            "Total size of a batch in producer request to kafka",
            &["client_ip"],
        );

        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "Kafkatap build info").namespace(NAMESPACE),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        Self {
            registry,
            producer_topics,
            consumer_topics,
            active_connections,
            typed_requests,
            producer_batch_length,
            producer_batch_size,
        }
    }

    /// A client wrote to a topic.
    pub fn register_producer(&self, client_ip: &str, topic: &str) {
        self.producer_topics
            .touch(vec![client_ip.to_owned(), topic.to_owned()], false);
    }

    /// A client fetched from a topic.
    pub fn register_consumer(&self, client_ip: &str, topic: &str) {
        self.consumer_topics
            .touch(vec![client_ip.to_owned(), topic.to_owned()], false);
    }

    /// A new client connection started streaming.
    pub fn register_connection(&self, client_ip: &str) {
        self.active_connections.touch(vec![client_ip.to_owned()], true);
    }

    /// Counts one decoded request of the given kind.
    pub fn count_request(&self, client_ip: &str, request_type: &str) {
        self.typed_requests
            .with_label_values(&[client_ip, request_type])
            .inc();
    }

    /// Accumulates the record count and byte size of one produce batch.
    pub fn observe_producer_batch(&self, client_ip: &str, records_len: u64, records_size: u64) {
        self.producer_batch_length
            .with_label_values(&[client_ip])
            .inc_by(records_len);
        self.producer_batch_size
            .with_label_values(&[client_ip])
            .inc_by(records_size);
    }

    /// Snapshot of every exposed series, for the exposition endpoint.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

impl Default for RelationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRE_TIME)
    }
}
