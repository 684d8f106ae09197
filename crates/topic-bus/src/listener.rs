//! Consumer side of the log stream: subscription plus dispatch loop.
//!
//! The loop only decodes and spawns. Each decoded delivery is handled on its own task, so a slow
//! or hung downstream call never delays the deliveries behind it. Deliveries are acknowledged by
//! the broker as they arrive; a handler failure, or a process exit while handlers are still
//! running, loses the envelope.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, Deliveries, ExchangeSpec};
use crate::connection::BrokerHandle;
use crate::envelope::{Envelope, LogPayload};
use crate::handler::EventHandler;
use crate::metrics;
use crate::topology::{declare_and_bind, QueueHandle};
use crate::{BusError, BusResult};

/// How often a saturated listener checks that the broker connection is still up.
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_millis(200);

pub struct Listener {
    broker: BrokerHandle,
    exchange: ExchangeSpec,
    handler: Arc<dyn EventHandler>,
    max_in_flight: Option<usize>,
}

impl Listener {
    pub fn new<H: EventHandler>(broker: BrokerHandle, exchange: ExchangeSpec, handler: H) -> Self {
        Self {
            broker,
            exchange,
            handler: Arc::new(handler),
            max_in_flight: None,
        }
    }

    /// Caps the number of handlers running at once. While the cap is reached the loop stops
    /// pulling deliveries. `None` leaves handling unbounded.
    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.max_in_flight = limit.filter(|limit| *limit > 0);
        self
    }

    /// Binds a fresh queue to `patterns` and starts consuming from it.
    ///
    /// Any declaration or bind failure is returned before a single delivery is accepted.
    pub async fn subscribe(&self, patterns: &[String]) -> BusResult<Subscription> {
        let channel = self.broker.open_channel().await?;
        let queue = declare_and_bind(channel.as_ref(), &self.exchange, patterns).await?;
        let deliveries = channel.consume(&queue.name).await.map_err(|err| match err {
            BusError::Subscribe(_) | BusError::Closed => err,
            other => BusError::Subscribe(other.to_string()),
        })?;
        info!(
            exchange = %self.exchange.name,
            queue = %queue.name,
            patterns = ?queue.patterns,
            "listening for events"
        );
        Ok(Subscription {
            broker: self.broker.clone(),
            channel,
            queue,
            deliveries,
            handler: self.handler.clone(),
            limiter: self.max_in_flight.map(|limit| Arc::new(Semaphore::new(limit))),
        })
    }

    /// Runs until the subscription is lost, which is always an error.
    pub async fn listen(&self, patterns: &[String]) -> BusResult<()> {
        self.subscribe(patterns).await?.run().await
    }

    /// Runs until the subscription is lost or `shutdown` resolves.
    pub async fn listen_until<F>(&self, patterns: &[String], shutdown: F) -> BusResult<()>
    where
        F: Future<Output = ()>,
    {
        self.subscribe(patterns).await?.run_until(shutdown).await
    }
}

/// A bound queue with a live consumer, ready to be driven.
pub struct Subscription {
    broker: BrokerHandle,
    channel: Box<dyn BrokerChannel>,
    queue: QueueHandle,
    deliveries: Deliveries,
    handler: Arc<dyn EventHandler>,
    limiter: Option<Arc<Semaphore>>,
}

impl Subscription {
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub async fn run(self) -> BusResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Drives the dispatch loop. Handlers still running when this returns are abandoned.
    pub async fn run_until<F>(mut self, shutdown: F) -> BusResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let outcome = loop {
            let envelope = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                next = self.deliveries.next() => match next {
                    Some(Ok(envelope)) => envelope,
                    Some(Err(err)) => {
                        error!(queue = %self.queue.name, error = %err, "subscription failed");
                        break Err(BusError::SubscriptionClosed);
                    }
                    None => {
                        error!(queue = %self.queue.name, "subscription channel closed");
                        break Err(BusError::SubscriptionClosed);
                    }
                },
            };

            let Some((routing_key, payload)) = decode(envelope) else {
                continue;
            };

            // The stream is not polled while the cap is full, so watch the connection instead.
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    _ = &mut shutdown => break Ok(()),
                    _ = connection_lost(&self.broker) => {
                        error!(
                            queue = %self.queue.name,
                            "broker connection lost while handlers were saturated"
                        );
                        break Err(BusError::SubscriptionClosed);
                    }
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break Err(BusError::SubscriptionClosed),
                    },
                },
                None => None,
            };

            spawn_handler(&self.handler, routing_key, payload, permit);
        };

        if outcome.is_ok() {
            info!(queue = %self.queue.name, "listener stopped");
            if let Err(err) = self.channel.close().await {
                warn!(error = %err, "failed to close consumer channel");
            }
        }
        outcome
    }
}

async fn connection_lost(broker: &BrokerHandle) {
    let mut ticker = tokio::time::interval(CONNECTION_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if !broker.is_connected() {
            return;
        }
    }
}

fn decode(envelope: Envelope) -> Option<(String, LogPayload)> {
    match envelope.decode() {
        Ok(payload) => {
            metrics::DELIVERED
                .with_label_values(&[metrics::label_name(&payload.label())])
                .inc();
            debug!(routing_key = %envelope.routing_key, name = %payload.name, "dispatching");
            Some((envelope.routing_key, payload))
        }
        Err(err) => {
            metrics::DECODE_FAILURES.inc();
            warn!(
                routing_key = %envelope.routing_key,
                bytes = envelope.body.len(),
                error = %err,
                "discarding malformed envelope"
            );
            None
        }
    }
}

fn spawn_handler(
    handler: &Arc<dyn EventHandler>,
    routing_key: String,
    payload: LogPayload,
    permit: Option<OwnedSemaphorePermit>,
) {
    let handler = handler.clone();
    tokio::spawn(async move {
        let _permit = permit;
        handler.handle(routing_key, payload).await;
    });
}
