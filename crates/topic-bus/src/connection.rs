use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::retry::{retry_connect, RetryExhausted, RetryPolicy};
use crate::{BusError, BusResult};

/// Knows how to dial one broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self) -> BusResult<Arc<dyn BrokerConnection>>;

    /// Human readable target for logs. Must not leak credentials.
    fn describe(&self) -> String;
}

/// Process-wide handle on the broker connection, injected into emitters and listeners.
#[derive(Clone)]
pub struct BrokerHandle {
    connection: Arc<dyn BrokerConnection>,
}

impl BrokerHandle {
    pub fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self { connection }
    }

    pub async fn open_channel(&self) -> BusResult<Box<dyn BrokerChannel>> {
        if !self.connection.is_connected() {
            return Err(BusError::Closed);
        }
        self.connection.open_channel().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Closes the underlying connection. Exclusive queues owned by it disappear with it.
    pub async fn shutdown(&self) -> BusResult<()> {
        if !self.connection.is_connected() {
            return Ok(());
        }
        info!("closing broker connection");
        self.connection.close().await
    }
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Owns the single reconnect loop of a process.
///
/// Concurrent callers of [`ConnectionManager::connect`] wait on the same dial sequence and all
/// receive the same handle.
pub struct ConnectionManager<C> {
    connector: C,
    policy: RetryPolicy,
    handle: OnceCell<BrokerHandle>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            handle: OnceCell::new(),
        }
    }

    /// Blocks until the broker accepts a connection. Only a bounded policy can fail.
    pub async fn connect(&self) -> Result<BrokerHandle, RetryExhausted> {
        self.handle
            .get_or_try_init(|| async {
                let target = self.connector.describe();
                let connection =
                    retry_connect(&target, &self.policy, || self.connector.dial()).await?;
                Ok(BrokerHandle::new(connection))
            })
            .await
            .cloned()
    }

    /// The handle, if a connection has been established.
    pub fn current(&self) -> Option<BrokerHandle> {
        self.handle.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBroker;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn waits_out_refused_dials() {
        let broker = LocalBroker::new();
        broker.refuse_next_dials(4);
        let manager = ConnectionManager::new(broker.clone(), RetryPolicy::broker());

        let handle = manager.connect().await.expect("unbounded");
        assert!(handle.is_connected());
        assert_eq!(broker.dial_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_dial_sequence() {
        let broker = LocalBroker::new();
        broker.refuse_next_dials(2);
        let manager = Arc::new(ConnectionManager::new(broker.clone(), RetryPolicy::broker()));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        first.await.unwrap().expect("connect");
        second.await.unwrap().expect("connect");

        assert_eq!(broker.dial_attempts(), 3);
        assert_eq!(broker.open_connections(), 1);
        assert!(manager.current().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up() {
        let broker = LocalBroker::new();
        broker.refuse_next_dials(10);
        let manager = ConnectionManager::new(
            broker.clone(),
            RetryPolicy::Bounded {
                attempts: 3,
                interval: Duration::from_millis(100),
            },
        );

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_channels() {
        let broker = LocalBroker::new();
        let manager = ConnectionManager::new(broker.clone(), RetryPolicy::broker());
        let handle = manager.connect().await.unwrap();

        handle.shutdown().await.unwrap();
        assert!(!handle.is_connected());
        assert!(matches!(handle.open_channel().await, Err(BusError::Closed)));
        // Second shutdown is a no-op.
        handle.shutdown().await.unwrap();
    }
}
