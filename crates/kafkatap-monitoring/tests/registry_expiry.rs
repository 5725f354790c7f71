//! Behavioral tests for the expiring relation registry.

use std::sync::Arc;
use std::time::Duration;

use kafkatap_monitoring::RelationRegistry;
use prometheus::proto::MetricFamily;

const EXPIRE: Duration = Duration::from_secs(60);

fn family(registry: &RelationRegistry, name: &str) -> Option<MetricFamily> {
    registry.gather().into_iter().find(|mf| mf.get_name() == name)
}

/// Value of the gauge series carrying exactly the given labels, if exposed.
fn series_value(registry: &RelationRegistry, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let family = family(registry, name)?;
    family
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
    family(registry, name).map_or(0, |mf| mf.get_metric().len())
}

#[tokio::test(start_paused = true)]
async fn repeated_observation_is_idempotent() {
    let registry = RelationRegistry::new(EXPIRE);
    for _ in 0..3 {
        registry.register_producer("10.0.0.1", "mytopic");
    }

    assert_eq!(
        series_value(
            &registry,
            "kafkatap_producer_topic_relation_info",
            &[("client_ip", "10.0.0.1"), ("topic", "mytopic")],
        ),
        Some(1.0)
    );
    assert_eq!(
        series_count(&registry, "kafkatap_producer_topic_relation_info"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn connection_observations_accumulate() {
    let registry = RelationRegistry::new(EXPIRE);
    registry.register_connection("10.0.0.1");
    registry.register_connection("10.0.0.1");
    registry.register_connection("10.0.0.2");

    assert_eq!(
        series_value(
            &registry,
            "kafkatap_active_connections_total",
            &[("client_ip", "10.0.0.1")],
        ),
        Some(2.0)
    );
    assert_eq!(
        series_value(
            &registry,
            "kafkatap_active_connections_total",
            &[("client_ip", "10.0.0.2")],
        ),
        Some(1.0)
    );
}

#[tokio::test(start_paused = true)]
async fn refresh_extends_expiry() {
    let registry = RelationRegistry::new(EXPIRE);
    let labels = [("client_ip", "10.0.0.3"), ("topic", "topicA")];

    registry.register_producer("10.0.0.3", "topicA");
    tokio::time::sleep(EXPIRE / 2).await;
    registry.register_producer("10.0.0.3", "topicA");

    // Past the original deadline, inside the refreshed one.
    tokio::time::sleep(EXPIRE / 2 + Duration::from_secs(1)).await;
    assert_eq!(
        series_value(&registry, "kafkatap_producer_topic_relation_info", &labels),
        Some(1.0)
    );

    // Past the refreshed deadline with no further observations.
    tokio::time::sleep(EXPIRE / 2).await;
    assert_eq!(
        series_value(&registry, "kafkatap_producer_topic_relation_info", &labels),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn idle_relations_are_evicted() {
    let registry = RelationRegistry::new(EXPIRE);
    registry.register_producer("10.0.0.1", "t1");
    registry.register_producer("10.0.0.1", "t2");
    registry.register_consumer("10.0.0.2", "t1");
    registry.register_connection("10.0.0.1");

    tokio::time::sleep(EXPIRE + Duration::from_secs(1)).await;

    assert_eq!(
        series_count(&registry, "kafkatap_producer_topic_relation_info"),
        0
    );
    assert_eq!(
        series_count(&registry, "kafkatap_consumer_topic_relation_info"),
        0
    );
    assert_eq!(series_count(&registry, "kafkatap_active_connections_total"), 0);
}

#[tokio::test(start_paused = true)]
async fn observation_after_eviction_recreates_series() {
    let registry = RelationRegistry::new(EXPIRE);
    let labels = [("client_ip", "10.0.0.5"), ("topic", "phoenix")];

    registry.register_consumer("10.0.0.5", "phoenix");
    tokio::time::sleep(EXPIRE + Duration::from_secs(1)).await;
    assert_eq!(
        series_value(&registry, "kafkatap_consumer_topic_relation_info", &labels),
        None
    );

    // The tuple comes back on its next observation, with a fresh timer.
    registry.register_consumer("10.0.0.5", "phoenix");
    assert_eq!(
        series_value(&registry, "kafkatap_consumer_topic_relation_info", &labels),
        Some(1.0)
    );
    tokio::time::sleep(EXPIRE + Duration::from_secs(1)).await;
    assert_eq!(
        series_value(&registry, "kafkatap_consumer_topic_relation_info", &labels),
        None
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_do_not_lose_updates() {
    let registry = Arc::new(RelationRegistry::new(EXPIRE));

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry.register_producer("10.0.0.4", &format!("t{i}"));
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        series_count(&registry, "kafkatap_producer_topic_relation_info"),
        100
    );
    for i in 0..100 {
        assert_eq!(
            series_value(
                &registry,
                "kafkatap_producer_topic_relation_info",
                &[("client_ip", "10.0.0.4"), ("topic", &format!("t{i}"))],
            ),
            Some(1.0),
            "series t{i}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn request_counters_accumulate() {
    let registry = RelationRegistry::new(EXPIRE);
    registry.count_request("10.0.0.1", "produce");
    registry.count_request("10.0.0.1", "produce");
    registry.count_request("10.0.0.1", "metadata");
    registry.observe_producer_batch("10.0.0.1", 3, 120);
    registry.observe_producer_batch("10.0.0.1", 2, 80);

    let counter = |name: &str, labels: &[(&str, &str)]| {
        family(&registry, name).and_then(|mf| {
            mf.get_metric()
                .iter()
                .find(|m| {
                    labels.iter().all(|(key, value)| {
                        m.get_label()
                            .iter()
                            .any(|l| l.get_name() == *key && l.get_value() == *value)
                    })
                })
                .map(|m| m.get_counter().get_value())
        })
    };

    assert_eq!(
        counter(
            "kafkatap_typed_requests_total",
            &[("client_ip", "10.0.0.1"), ("request_type", "produce")],
        ),
        Some(2.0)
    );
    assert_eq!(
        counter(
            "kafkatap_typed_requests_total",
            &[("client_ip", "10.0.0.1"), ("request_type", "metadata")],
        ),
        Some(1.0)
    );
    assert_eq!(
        counter("kafkatap_producer_batch_length", &[("client_ip", "10.0.0.1")]),
        Some(5.0)
    );
    assert_eq!(
        counter("kafkatap_producer_batch_size", &[("client_ip", "10.0.0.1")]),
        Some(200.0)
    );
}
