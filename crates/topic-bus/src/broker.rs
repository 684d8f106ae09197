//! Seam between the core and a concrete message broker.
//!
//! A [`BrokerConnection`] is a single logical connection; a [`BrokerChannel`] is a session over
//! it. Channels are never shared between concurrent publishers: every publish opens its own.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{BusResult, Envelope};

/// Auto-acknowledged deliveries of a consumption subscription. The stream ends when the
/// subscription is lost.
pub type Deliveries = BoxStream<'static, BusResult<Envelope>>;

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> BusResult<Box<dyn BrokerChannel>>;
    fn is_connected(&self) -> bool;
    async fn close(&self) -> BusResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange. Redeclaring with identical properties is a no-op; conflicting
    /// properties fail.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> BusResult<()>;

    /// Declares a queue and returns its name, which the broker picks when `queue.name` is empty.
    async fn declare_queue(&self, queue: &QueueSpec) -> BusResult<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        options: PublishOptions,
    ) -> BusResult<()>;

    /// Starts an auto-acknowledged subscription on `queue`.
    async fn consume(&self, queue: &str) -> BusResult<Deliveries>;

    async fn close(&self) -> BusResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange, the shape used for the log stream.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Server-named queue that lives and dies with the declaring connection.
    pub fn anonymous() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Publish flags. Both default to `false`: unroutable messages are dropped by the broker and
/// messages queue even when no consumer is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}
