//! Live metric ingestion over real pub/sub sockets.

use std::sync::Arc;
use std::time::Duration;

use benchq::{
    InMemoryRunStore, MetricSubscriber, MetricTopic, RunConfig, RunEventPayload, RunId,
    RunStatus, RunStore, SubscriberConfig,
};
use benchq_testkit::{MetricPublisher, RecordingStore, eventually, init_tracing};
use serde_json::json;
use tokio::time::timeout;

fn subscriber_config() -> SubscriberConfig {
    SubscriberConfig {
        recv_timeout_ms: 50,
        shutdown_timeout_ms: 1000,
        connect_timeout_ms: 200,
        connect_retry_ms: 20,
    }
}

/// Run `publish` until the store holds at least `count` metrics for the
/// run. Early messages are lost while the subscription propagates.
async fn publish_until_stored<S: RunStore>(
    publisher: &mut MetricPublisher,
    store: &S,
    run_id: RunId,
    count: usize,
    mut publish: impl AsyncFnMut(&mut MetricPublisher),
) {
    timeout(Duration::from_secs(10), async {
        while store.get_metrics(run_id).await.unwrap().len() < count {
            publish(&mut *publisher).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("metrics should be ingested");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingests_both_topics_in_order() {
    init_tracing();
    let store = Arc::new(InMemoryRunStore::new());
    let subscriber = MetricSubscriber::new(Arc::clone(&store), subscriber_config());
    let mut publisher = MetricPublisher::bind_local().await.unwrap();
    let run_id = RunId::new();

    assert!(subscriber.subscribe_to_run(run_id, publisher.endpoint()));

    let mut seq = 0u64;
    publish_until_stored(&mut publisher, store.as_ref(), run_id, 6, async |p| {
        seq += 1;
        p.publish("realtime_metrics", &json!({"seq": seq, "throughput": 12.5}))
            .await
            .unwrap();
        p.publish("realtime_telemetry_metrics", &json!({"seq": seq, "gpu_util": 0.9}))
            .await
            .unwrap();
    })
    .await;

    let records = store.get_metrics(run_id).await.unwrap();
    assert!(records.iter().all(|r| r.run_id == run_id));
    let seqs: Vec<u64> = records
        .iter()
        .filter(|r| r.topic == "realtime_metrics")
        .map(|r| r.data["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "receipt order: {seqs:?}");

    let summary = store.metric_summary(run_id).await.unwrap();
    assert_eq!(
        summary.topics,
        vec![
            MetricTopic::RealtimeMetrics.to_string(),
            MetricTopic::RealtimeTelemetryMetrics.to_string(),
        ]
    );
    assert_eq!(summary.total_count, records.len());

    assert!(subscriber.unsubscribe_from_run(run_id).await);
    publisher.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_and_foreign_messages_are_dropped() {
    init_tracing();
    let store = Arc::new(InMemoryRunStore::new());
    let subscriber = MetricSubscriber::new(Arc::clone(&store), subscriber_config());
    let mut publisher = MetricPublisher::bind_local().await.unwrap();
    let run_id = RunId::new();
    subscriber.subscribe_to_run(run_id, publisher.endpoint());

    publish_until_stored(&mut publisher, store.as_ref(), run_id, 3, async |p| {
        p.publish_raw(b"realtime_metrics$", b"{not json").await.unwrap();
        p.publish_raw(b"realtime_metrics$\xff", b"{}").await.unwrap();
        p.publish_frames(&[&b"realtime_metrics$"[..]]).await.unwrap();
        p.publish_frames(&[&b"realtime_metrics$"[..], &b"{}"[..], &b"{}"[..]])
            .await
            .unwrap();
        p.publish("realtime_metrics_debug", &json!({"debug": true}))
            .await
            .unwrap();
        p.publish_raw(b"realtime_metrics", b"{\"no_sentinel\":true}")
            .await
            .unwrap();
        p.publish("realtime_metrics", &json!({"ok": true})).await.unwrap();
    })
    .await;

    // The loop kept going after every bad message and only stored the
    // well-formed one.
    let records = store.get_metrics(run_id).await.unwrap();
    assert!(records.len() >= 3);
    for record in &records {
        assert_eq!(record.topic, "realtime_metrics");
        assert_eq!(record.data, json!({"ok": true}));
    }
    assert!(subscriber.is_subscribed(run_id));

    subscriber.stop_all().await;
    assert_eq!(subscriber.subscription_count(), 0);
    publisher.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_failures_do_not_end_ingestion() {
    init_tracing();
    let store = Arc::new(RecordingStore::new());
    let subscriber = MetricSubscriber::new(Arc::clone(&store), subscriber_config());
    let mut publisher = MetricPublisher::bind_local().await.unwrap();
    let run_id = RunId::new();
    subscriber.subscribe_to_run(run_id, publisher.endpoint());

    publish_until_stored(&mut publisher, store.as_ref(), run_id, 1, async |p| {
        p.publish("realtime_metrics", &json!({"kept": true})).await.unwrap();
    })
    .await;

    store.set_fail_appends(true);
    let before = store.get_metrics(run_id).await.unwrap().len();
    for _ in 0..10 {
        publisher
            .publish("realtime_metrics", &json!({"lost": true}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get_metrics(run_id).await.unwrap().len(), before);

    store.set_fail_appends(false);
    publish_until_stored(&mut publisher, store.as_ref(), run_id, before + 1, async |p| {
        p.publish("realtime_metrics", &json!({"kept": true})).await.unwrap();
    })
    .await;
    let records = store.get_metrics(run_id).await.unwrap();
    assert!(records.iter().all(|r| r.data == json!({"kept": true})));

    subscriber.stop_all().await;
    publisher.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_stops_ingestion_and_allows_resubscribe() {
    init_tracing();
    let store = Arc::new(InMemoryRunStore::new());
    let subscriber = MetricSubscriber::new(Arc::clone(&store), subscriber_config());
    let mut publisher = MetricPublisher::bind_local().await.unwrap();
    let run_id = RunId::new();

    subscriber.subscribe_to_run(run_id, publisher.endpoint());
    publish_until_stored(&mut publisher, store.as_ref(), run_id, 1, async |p| {
        p.publish("realtime_metrics", &json!({"phase": 1})).await.unwrap();
    })
    .await;

    let stopped = timeout(Duration::from_secs(3), subscriber.unsubscribe_from_run(run_id))
        .await
        .expect("unsubscribe is bounded");
    assert!(stopped);
    assert!(!subscriber.is_subscribed(run_id));
    assert!(!subscriber.unsubscribe_from_run(run_id).await);

    let before = store.get_metrics(run_id).await.unwrap().len();
    for _ in 0..5 {
        publisher
            .publish("realtime_metrics", &json!({"phase": 2}))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.get_metrics(run_id).await.unwrap().len(), before);

    assert!(subscriber.subscribe_to_run(run_id, publisher.endpoint()));
    publish_until_stored(&mut publisher, store.as_ref(), run_id, before + 1, async |p| {
        p.publish("realtime_metrics", &json!({"phase": 3})).await.unwrap();
    })
    .await;
    let last = store.get_metrics(run_id).await.unwrap().pop().unwrap();
    assert_eq!(last.data, json!({"phase": 3}));

    subscriber.stop_all().await;
    publisher.close().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_controller_attaches_metrics_for_running_run() {
    use benchq::RunControllerBuilder;
    use benchq_testkit::ScriptedTool;

    init_tracing();
    let store = RecordingStore::new();
    let config = ScriptedTool::sleep(30.0)
        .with_grace_period_ms(500)
        .orchestrator_config(41_000);
    let controller = RunControllerBuilder::new(config)
        .with_store(Arc::new(store.clone()))
        .build()
        .unwrap();
    let mut events = controller.subscribe_events();

    let run = controller
        .submit("gpu-a", RunConfig::new("m", "http://localhost:8000", "tok"))
        .await
        .unwrap();

    let endpoint = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if let RunEventPayload::MetricsAttached { endpoint, .. } = event.payload
                && event.run_id == run.id
            {
                return endpoint;
            }
        }
    })
    .await
    .expect("metrics should attach");
    assert_eq!(endpoint, "tcp://127.0.0.1:41001");

    // The subscriber is already retrying against this endpoint.
    let mut publisher = MetricPublisher::bind(&endpoint).await.unwrap();
    publish_until_stored(&mut publisher, &store, run.id, 3, async |p| {
        p.publish("realtime_metrics", &json!({"ttft_ms": 41.0})).await.unwrap();
    })
    .await;

    assert!(controller.cancel(run.id).await.unwrap());
    assert!(
        eventually(Duration::from_secs(5), || async {
            !controller.subscriber().is_subscribed(run.id)
        })
        .await
    );
    assert_eq!(
        controller.run(run.id).await.unwrap().unwrap().status,
        RunStatus::Cancelled
    );

    // Metrics survive the run.
    let summary = controller.metric_summary(run.id).await.unwrap();
    assert!(summary.total_count >= 3);
    assert_eq!(summary.topics, vec!["realtime_metrics".to_string()]);

    controller.stop().await;
    publisher.close().await;
}
