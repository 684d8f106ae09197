use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use test_timeout::tokio_timeout_test;
use tokio::sync::mpsc;
use tokio::time::Instant;
use topic_bus::{
    metrics, BrokerHandle, ConnectionManager, Emitter, EventHandler, ExchangeSpec, Listener,
    LocalBroker, LogPayload, RetryPolicy, Severity, LOG_EXCHANGE,
};

struct Forward {
    tx: mpsc::UnboundedSender<(String, LogPayload)>,
}

#[async_trait]
impl EventHandler for Forward {
    async fn handle(&self, routing_key: String, payload: LogPayload) {
        let _ = self.tx.send((routing_key, payload));
    }
}

fn topics(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

async fn connect(broker: &LocalBroker) -> BrokerHandle {
    ConnectionManager::new(broker.clone(), RetryPolicy::broker())
        .connect()
        .await
        .expect("local broker accepts connections")
}

async fn emitter(handle: &BrokerHandle) -> Emitter {
    Emitter::new(handle.clone(), ExchangeSpec::topic(LOG_EXCHANGE))
        .await
        .expect("declare exchange")
}

async fn spawn_listener(
    handle: &BrokerHandle,
    patterns: &[&str],
) -> mpsc::UnboundedReceiver<(String, LogPayload)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::new(
        handle.clone(),
        ExchangeSpec::topic(LOG_EXCHANGE),
        Forward { tx },
    );
    let subscription = listener.subscribe(&topics(patterns)).await.expect("subscribe");
    tokio::spawn(subscription.run());
    rx
}

#[tokio_timeout_test(10)]
async fn routes_by_topic_pattern() {
    let broker = LocalBroker::new();
    let handle = connect(&broker).await;
    let emitter = emitter(&handle).await;

    let mut exact = spawn_listener(&handle, &["log.ERROR"]).await;
    let mut wildcard = spawn_listener(&handle, &["log.*"]).await;
    let mut info_only = spawn_listener(&handle, &["log.INFO"]).await;

    emitter
        .emit_log("log", "disk full", Severity::Error)
        .await
        .unwrap();
    emitter
        .emit_log("log", "sentinel", Severity::Info)
        .await
        .unwrap();

    let (key, payload) = exact.recv().await.unwrap();
    assert_eq!(key, "log.ERROR");
    assert_eq!(payload.data, "disk full");

    let (key, _) = wildcard.recv().await.unwrap();
    assert_eq!(key, "log.ERROR");
    let (key, _) = wildcard.recv().await.unwrap();
    assert_eq!(key, "log.INFO");

    // The first thing the INFO-only queue sees is the sentinel: log.ERROR never reached it.
    let (key, payload) = info_only.recv().await.unwrap();
    assert_eq!(key, "log.INFO");
    assert_eq!(payload.data, "sentinel");
}

#[tokio_timeout_test(10)]
async fn one_queue_with_several_patterns_sees_each_envelope_once() {
    let broker = LocalBroker::new();
    let handle = connect(&broker).await;
    let emitter = emitter(&handle).await;
    let mut rx = spawn_listener(&handle, &["log.ERROR", "log.*", "#"]).await;

    emitter
        .emit_log("log", "first", Severity::Error)
        .await
        .unwrap();
    emitter
        .emit_log("log", "second", Severity::Info)
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().1.data, "first");
    assert_eq!(rx.recv().await.unwrap().1.data, "second");
}

struct Sleepy {
    done: mpsc::UnboundedSender<(String, Instant)>,
}

#[async_trait]
impl EventHandler for Sleepy {
    async fn handle(&self, _routing_key: String, payload: LogPayload) {
        if payload.data == "A" {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let _ = self.done.send((payload.data, Instant::now()));
    }
}

#[tokio_timeout_test(10, paused)]
async fn slow_handler_does_not_delay_later_deliveries() {
    let broker = LocalBroker::new();
    let handle = connect(&broker).await;
    let emitter = emitter(&handle).await;

    let (done, mut completed) = mpsc::unbounded_channel();
    let listener = Listener::new(
        handle.clone(),
        ExchangeSpec::topic(LOG_EXCHANGE),
        Sleepy { done },
    );
    let subscription = listener.subscribe(&topics(&["log.INFO"])).await.unwrap();
    tokio::spawn(subscription.run());

    let started = Instant::now();
    for data in ["A", "B", "C"] {
        emitter.emit_log("log", data, Severity::Info).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(completed.recv().await.unwrap());
    }
    let names: Vec<&str> = order.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["B", "C", "A"]);
    assert!(order[0].1 - started < Duration::from_secs(1));
    assert!(order[1].1 - started < Duration::from_secs(1));
    assert!(order[2].1 - started >= Duration::from_secs(5));
}

#[tokio_timeout_test(10)]
async fn malformed_envelope_is_skipped() {
    let broker = LocalBroker::new();
    let handle = connect(&broker).await;
    let emitter = emitter(&handle).await;
    let mut rx = spawn_listener(&handle, &["log.INFO"]).await;
    let failures_before = metrics::DECODE_FAILURES.get();

    emitter
        .publish("log.INFO", "definitely not json")
        .await
        .unwrap();
    emitter
        .publish("log.INFO", r#"{"name":"log"}"#)
        .await
        .unwrap();
    emitter
        .emit_log("log", "still flowing", Severity::Info)
        .await
        .unwrap();

    let (_, payload) = rx.recv().await.unwrap();
    assert_eq!(payload, LogPayload::new("log", "still flowing"));
    assert!(metrics::DECODE_FAILURES.get() >= failures_before + 2);
}

struct Stuck {
    received: mpsc::UnboundedSender<LogPayload>,
}

#[async_trait]
impl EventHandler for Stuck {
    async fn handle(&self, _routing_key: String, payload: LogPayload) {
        let _ = self.received.send(payload);
        std::future::pending::<()>().await;
    }
}

#[tokio_timeout_test(10, paused)]
async fn acknowledged_delivery_is_not_redelivered_after_crash() {
    let broker = LocalBroker::new();
    let producer = connect(&broker).await;
    let emitter = emitter(&producer).await;

    // First consumer process: receives the envelope, then dies before handling finishes.
    let consumer = BrokerHandle::new(Arc::new(broker.connect().unwrap()));
    let (received, mut first_seen) = mpsc::unbounded_channel();
    let listener = Listener::new(
        consumer.clone(),
        ExchangeSpec::topic(LOG_EXCHANGE),
        Stuck { received },
    );
    let subscription = listener.subscribe(&topics(&["log.INFO"])).await.unwrap();
    let crashed_queue = subscription.queue().name.clone();
    let running = tokio::spawn(subscription.run());

    emitter
        .emit_log("log", "in flight", Severity::Info)
        .await
        .unwrap();
    assert_eq!(first_seen.recv().await.unwrap().data, "in flight");
    assert_eq!(broker.pending(&crashed_queue), 0);

    running.abort();
    consumer.shutdown().await.unwrap();
    assert!(!broker.queue_names().contains(&crashed_queue));

    // Restarted consumer: a new queue, and nothing from before the crash.
    let restarted = BrokerHandle::new(Arc::new(broker.connect().unwrap()));
    let mut second = spawn_listener(&restarted, &["log.INFO"]).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(second.try_recv().is_err());

    emitter
        .emit_log("log", "after restart", Severity::Info)
        .await
        .unwrap();
    assert_eq!(second.recv().await.unwrap().1.data, "after restart");
    assert!(second.try_recv().is_err());
}

#[tokio_timeout_test(10)]
async fn messages_published_before_binding_are_lost() {
    let broker = LocalBroker::new();
    let handle = connect(&broker).await;
    let emitter = emitter(&handle).await;

    emitter
        .emit_log("log", "too early", Severity::Error)
        .await
        .unwrap();
    let mut rx = spawn_listener(&handle, &["log.ERROR"]).await;
    emitter
        .emit_log("log", "on time", Severity::Error)
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().1.data, "on time");
}
