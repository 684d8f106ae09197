//! Exchange and queue declarations shared by producers and consumers.

use tracing::debug;

use crate::broker::{BrokerChannel, ExchangeSpec, QueueSpec};
use crate::{BusError, BusResult};

/// An anonymous queue bound to a set of routing-key patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub patterns: Vec<String>,
}

/// Declares `exchange`. Safe to call from every participant at every startup.
pub async fn ensure_exchange(channel: &dyn BrokerChannel, exchange: &ExchangeSpec) -> BusResult<()> {
    channel
        .declare_exchange(exchange)
        .await
        .map_err(|err| match err {
            BusError::Topology(_) | BusError::Closed => err,
            other => BusError::Topology(other.to_string()),
        })
}

/// Declares the exchange, then an anonymous exclusive queue bound to each pattern in order.
///
/// The first failing bind aborts the sequence and names its pattern. The queue is left behind;
/// it disappears with the connection.
pub async fn declare_and_bind(
    channel: &dyn BrokerChannel,
    exchange: &ExchangeSpec,
    patterns: &[String],
) -> BusResult<QueueHandle> {
    ensure_exchange(channel, exchange).await?;

    let name = channel
        .declare_queue(&QueueSpec::anonymous())
        .await
        .map_err(|err| match err {
            BusError::Topology(_) | BusError::Closed => err,
            other => BusError::Topology(other.to_string()),
        })?;

    for pattern in patterns {
        channel
            .bind_queue(&name, &exchange.name, pattern)
            .await
            .map_err(|err| BusError::Bind {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;
        debug!(queue = %name, exchange = %exchange.name, pattern = %pattern, "queue bound");
    }

    Ok(QueueHandle {
        name,
        patterns: patterns.to_vec(),
    })
}
