//! Producer side of the log stream.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, ExchangeSpec, PublishOptions};
use crate::connection::BrokerHandle;
use crate::envelope::{Envelope, LogPayload, Severity};
use crate::metrics;
use crate::topology::ensure_exchange;
use crate::{BusError, BusResult};

/// Fire-and-forget publisher bound to one topic exchange.
///
/// Every call opens its own channel, so an `Emitter` can be cloned freely across request
/// handlers. A successful return only means the broker accepted the write: nothing waits for a
/// publisher confirmation, and envelopes no binding matches are dropped by the broker.
#[derive(Clone, Debug)]
pub struct Emitter {
    broker: BrokerHandle,
    exchange: ExchangeSpec,
}

impl Emitter {
    /// Declares `exchange` and returns an emitter publishing to it.
    pub async fn new(broker: BrokerHandle, exchange: ExchangeSpec) -> BusResult<Self> {
        let channel = broker.open_channel().await?;
        let declared = ensure_exchange(channel.as_ref(), &exchange).await;
        close_quietly(channel.as_ref()).await;
        declared?;
        Ok(Self { broker, exchange })
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub async fn publish(&self, routing_key: &str, body: impl Into<Bytes>) -> BusResult<()> {
        self.publish_batch(vec![Envelope::new(routing_key, body)])
            .await
    }

    /// Publishes `envelopes` in order over a single channel. Stops at the first failure.
    pub async fn publish_batch(&self, envelopes: Vec<Envelope>) -> BusResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }
        let channel = self.broker.open_channel().await.map_err(|err| {
            metrics::PUBLISH_FAILURES.inc();
            err
        })?;

        let mut outcome = Ok(());
        for envelope in envelopes {
            match channel
                .publish(
                    &self.exchange.name,
                    &envelope.routing_key,
                    envelope.body,
                    PublishOptions::default(),
                )
                .await
            {
                Ok(()) => {
                    metrics::PUBLISHED
                        .with_label_values(&[self.exchange.name.as_str()])
                        .inc();
                    debug!(exchange = %self.exchange.name, routing_key = %envelope.routing_key, "published");
                }
                Err(err) => {
                    metrics::PUBLISH_FAILURES.inc();
                    outcome = Err(match err {
                        BusError::Closed => BusError::Closed,
                        other => BusError::Publish(other.to_string()),
                    });
                    break;
                }
            }
        }

        let closed = channel.close().await;
        outcome?;
        closed
    }

    /// Encodes `payload` as JSON and publishes it under `routing_key`.
    pub async fn emit(&self, routing_key: &str, payload: &LogPayload) -> BusResult<()> {
        let envelope = Envelope::encode(routing_key, payload)?;
        self.publish_batch(vec![envelope]).await
    }

    /// Publishes a `{name, data}` log event routed by `severity`.
    pub async fn emit_log(&self, name: &str, data: &str, severity: Severity) -> BusResult<()> {
        self.emit(severity.routing_key(), &LogPayload::new(name, data))
            .await
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        warn!(error = %err, "failed to close channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, ExchangeKind, QueueSpec};
    use crate::local::LocalBroker;
    use futures::StreamExt;
    use std::sync::Arc;

    async fn handle(broker: &LocalBroker) -> BrokerHandle {
        BrokerHandle::new(Arc::new(broker.connect().unwrap()))
    }

    #[tokio::test]
    async fn construction_declares_exchange_once() {
        let broker = LocalBroker::new();
        let handle = handle(&broker).await;
        let exchange = ExchangeSpec::topic("logs_topic");

        Emitter::new(handle.clone(), exchange.clone()).await.unwrap();
        Emitter::new(handle, exchange).await.unwrap();
        assert_eq!(broker.exchange_count(), 1);
    }

    #[tokio::test]
    async fn published_counter_is_keyed_by_exchange() {
        let broker = LocalBroker::new();
        let exchange = ExchangeSpec::topic("counted_topic");
        let emitter = Emitter::new(handle(&broker).await, exchange).await.unwrap();
        let before = metrics::PUBLISHED
            .with_label_values(&["counted_topic"])
            .get();

        for i in 0..3 {
            emitter
                .publish(&format!("tenant.{i}.unique-key"), Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }
        assert_eq!(
            metrics::PUBLISHED
                .with_label_values(&["counted_topic"])
                .get(),
            before + 3
        );
        let text = String::from_utf8(metrics::gather()).unwrap();
        assert!(!text.contains("unique-key"));
    }

    #[tokio::test]
    async fn construction_fails_on_conflicting_exchange() {
        let broker = LocalBroker::new();
        let handle = handle(&broker).await;
        let mut fanout = ExchangeSpec::topic("logs_topic");
        fanout.kind = ExchangeKind::Fanout;
        Emitter::new(handle.clone(), fanout).await.unwrap();

        let err = Emitter::new(handle, ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Topology(_)), "{err}");
    }

    #[tokio::test]
    async fn unroutable_publish_succeeds() {
        let broker = LocalBroker::new();
        let emitter = Emitter::new(handle(&broker).await, ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap();
        emitter
            .emit_log("log", "nobody is listening", Severity::Info)
            .await
            .unwrap();
        assert!(broker.returned().is_empty());
    }

    #[tokio::test]
    async fn emit_log_routes_by_severity() {
        let broker = LocalBroker::new();
        let handle = handle(&broker).await;
        let emitter = Emitter::new(handle.clone(), ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap();

        let channel = handle.open_channel().await.unwrap();
        let queue = channel.declare_queue(&QueueSpec::anonymous()).await.unwrap();
        channel
            .bind_queue(&queue, "logs_topic", "log.ERROR")
            .await
            .unwrap();
        let mut deliveries = channel.consume(&queue).await.unwrap();

        emitter
            .emit_log("log", "ignored", Severity::Info)
            .await
            .unwrap();
        emitter
            .emit_log("log", "disk full", Severity::Error)
            .await
            .unwrap();

        let envelope = deliveries.next().await.unwrap().unwrap();
        assert_eq!(envelope.routing_key, "log.ERROR");
        assert_eq!(envelope.decode().unwrap(), LogPayload::new("log", "disk full"));
        assert_eq!(broker.pending(&queue), 0);
        assert_eq!(broker.delivered(&queue), 1);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_an_error() {
        let broker = LocalBroker::new();
        let handle = handle(&broker).await;
        let emitter = Emitter::new(handle.clone(), ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap();

        handle.shutdown().await.unwrap();
        let err = emitter.publish("log.INFO", "late").await.unwrap_err();
        assert!(matches!(err, BusError::Closed), "{err}");
    }

    #[tokio::test]
    async fn batch_uses_one_channel_and_keeps_order() {
        let broker = LocalBroker::new();
        let handle = handle(&broker).await;
        let emitter = Emitter::new(handle.clone(), ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap();

        let connection = broker.connect().unwrap();
        let channel = connection.open_channel().await.unwrap();
        let queue = channel.declare_queue(&QueueSpec::anonymous()).await.unwrap();
        channel.bind_queue(&queue, "logs_topic", "log.#").await.unwrap();

        emitter
            .publish_batch(vec![
                Envelope::new("log.INFO", "one"),
                Envelope::new("log.ERROR", "two"),
                Envelope::new("log.INFO", "three"),
            ])
            .await
            .unwrap();

        let deliveries = channel.consume(&queue).await.unwrap();
        let bodies: Vec<Bytes> = deliveries
            .take(3)
            .map(|delivery| delivery.unwrap().body)
            .collect()
            .await;
        assert_eq!(
            bodies,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three")
            ]
        );
    }

    #[tokio::test]
    async fn oversized_routing_key_fails_the_publish() {
        let broker = LocalBroker::new();
        let emitter = Emitter::new(handle(&broker).await, ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap();
        let key = "k".repeat(300);
        let err = emitter.publish(&key, "x").await.unwrap_err();
        assert!(matches!(err, BusError::Publish(_)), "{err}");
    }
}
