//! Event distribution core for the service constellation.
//!
//! Producers publish envelopes to a durable topic exchange through an [`Emitter`]; consumers bind
//! an anonymous queue to routing-key patterns and run a [`Listener`], which decodes every
//! delivery and hands it to an independent handler task. Both sides share one process-wide
//! [`BrokerHandle`] obtained from a [`ConnectionManager`].

use thiserror::Error;

pub mod broker;
pub mod connection;
pub mod emitter;
pub mod envelope;
pub mod handler;
pub mod listener;
pub mod local;
pub mod metrics;
pub mod retry;
pub mod sink;
pub mod topic;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use broker::{
    BrokerChannel, BrokerConnection, Deliveries, ExchangeKind, ExchangeSpec, PublishOptions,
    QueueSpec,
};
pub use connection::{BrokerHandle, ConnectionManager, Connector};
pub use emitter::Emitter;
pub use envelope::{Envelope, Label, LogPayload, LogResponse, Severity};
pub use handler::{EventHandler, LogSinkHandler};
pub use listener::{Listener, Subscription};
pub use local::{LocalBroker, LocalConnection};
pub use retry::{retry_connect, RetryExhausted, RetryPolicy};
pub use sink::{LogSinkClient, SinkConfig, SinkError};
pub use topic::TopicPattern;
pub use topology::QueueHandle;

/// Name of the exchange shared by every producer and consumer of the log stream.
pub const LOG_EXCHANGE: &str = "logs_topic";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker connection closed")]
    Closed,
    #[error("channel error: {0}")]
    Channel(String),
    #[error("topology declaration failed: {0}")]
    Topology(String),
    #[error("failed to bind queue to topic {pattern}: {reason}")]
    Bind { pattern: String, reason: String },
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("failed to register consumer: {0}")]
    Subscribe(String),
    #[error("subscription channel closed")]
    SubscriptionClosed,
    #[error("envelope encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;
