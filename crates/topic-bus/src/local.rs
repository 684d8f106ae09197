//! In-process topic broker for tests and single-process deployments.
//!
//! Mirrors the broker semantics the core relies on: idempotent declarations with precondition
//! checks, exclusive queues that vanish with their connection, topic routing, and
//! auto-acknowledged delivery. A delivered envelope is gone from the broker; nothing is ever
//! redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::broker::{
    BrokerChannel, BrokerConnection, Deliveries, ExchangeSpec, PublishOptions, QueueSpec,
};
use crate::connection::Connector;
use crate::topic::TopicPattern;
use crate::{BusError, BusResult, Envelope};

/// Longest routing key or binding pattern the broker accepts, in bytes.
pub const MAX_ROUTING_KEY_LEN: usize = 255;

#[derive(Clone, Default)]
pub struct LocalBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, LocalQueue>,
    bindings: Vec<Binding>,
    open_connections: usize,
    refuse_dials: u32,
    dial_attempts: u32,
    returned: Vec<Envelope>,
}

struct LocalQueue {
    spec: QueueSpec,
    owner: u64,
    backlog: VecDeque<Envelope>,
    consumer: Option<LocalConsumer>,
    delivered: u64,
}

struct LocalConsumer {
    connection: u64,
    channel: u64,
    sender: mpsc::UnboundedSender<BusResult<Envelope>>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: TopicPattern,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Opens a connection, unless a refused dial is pending.
    pub fn connect(&self) -> BusResult<LocalConnection> {
        let mut state = self.state.lock();
        state.dial_attempts += 1;
        if state.refuse_dials > 0 {
            state.refuse_dials -= 1;
            return Err(BusError::Connect("connection refused".into()));
        }
        state.open_connections += 1;
        drop(state);
        Ok(LocalConnection {
            broker: self.clone(),
            id: self.next_id(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Makes the next `count` dials fail as if the broker were still starting.
    pub fn refuse_next_dials(&self, count: u32) {
        self.state.lock().refuse_dials = count;
    }

    pub fn dial_attempts(&self) -> u32 {
        self.state.lock().dial_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Binding patterns registered for `queue`, in bind order.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| binding.pattern.as_str().to_string())
            .collect()
    }

    /// Envelopes waiting in `queue` for a consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Envelopes handed to a consumer of `queue` so far.
    pub fn delivered(&self, queue: &str) -> u64 {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.delivered)
            .unwrap_or(0)
    }

    /// Unroutable envelopes published with `mandatory` or `immediate` set.
    pub fn returned(&self) -> Vec<Envelope> {
        self.state.lock().returned.clone()
    }

    fn close_connection(&self, connection: u64) {
        let mut state = self.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);

        let doomed: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.spec.exclusive && queue.owner == connection)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            state.queues.remove(name);
        }
        state
            .bindings
            .retain(|binding| !doomed.contains(&binding.queue));

        for queue in state.queues.values_mut() {
            if matches!(&queue.consumer, Some(c) if c.connection == connection) {
                queue.consumer = None;
            }
        }
        debug!(connection, dropped_queues = doomed.len(), "local connection closed");
    }

    /// Cancels the consumers registered on `channel`. Auto-delete queues lose their last
    /// consumer here and are deleted along with their bindings.
    fn close_channel(&self, channel: u64) {
        let mut state = self.state.lock();
        let mut doomed = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            if matches!(&queue.consumer, Some(c) if c.channel == channel) {
                queue.consumer = None;
                if queue.spec.auto_delete {
                    doomed.push(name.clone());
                }
            }
        }
        for name in &doomed {
            state.queues.remove(name);
        }
        state
            .bindings
            .retain(|binding| !doomed.contains(&binding.queue));
        if !doomed.is_empty() {
            debug!(channel, dropped_queues = doomed.len(), "auto-delete queues removed");
        }
    }
}

#[async_trait]
impl Connector for LocalBroker {
    async fn dial(&self) -> BusResult<Arc<dyn BrokerConnection>> {
        let connection = self.connect()?;
        Ok(Arc::new(connection))
    }

    fn describe(&self) -> String {
        "local broker".to_string()
    }
}

impl BrokerState {
    fn route(&mut self, envelope: Envelope, exchange: &str, options: PublishOptions) {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && binding.pattern.matches(&envelope.routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        if targets.is_empty() {
            trace!(routing_key = %envelope.routing_key, exchange, "unroutable envelope dropped");
            if options.mandatory {
                self.returned.push(envelope);
            }
            return;
        }

        for target in targets {
            let auto_deleted = match self.queues.get_mut(&target) {
                Some(queue) => queue.offer(envelope.clone(), options, &mut self.returned),
                None => false,
            };
            if auto_deleted {
                self.queues.remove(&target);
                self.bindings.retain(|binding| binding.queue != target);
            }
        }
    }
}

impl LocalQueue {
    /// Delivers or enqueues `envelope`. Returns `true` when the queue should be auto-deleted
    /// because its consumer went away.
    fn offer(
        &mut self,
        envelope: Envelope,
        options: PublishOptions,
        returned: &mut Vec<Envelope>,
    ) -> bool {
        if let Some(consumer) = &self.consumer {
            match consumer.sender.send(Ok(envelope)) {
                Ok(()) => {
                    self.delivered += 1;
                    return false;
                }
                Err(mpsc::error::SendError(undelivered)) => {
                    self.consumer = None;
                    if self.spec.auto_delete {
                        return true;
                    }
                    if let Ok(envelope) = undelivered {
                        self.enqueue(envelope, options, returned);
                    }
                    return false;
                }
            }
        }
        self.enqueue(envelope, options, returned);
        false
    }

    fn enqueue(&mut self, envelope: Envelope, options: PublishOptions, returned: &mut Vec<Envelope>) {
        if options.immediate {
            returned.push(envelope);
        } else {
            self.backlog.push_back(envelope);
        }
    }
}

pub struct LocalConnection {
    broker: LocalBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn open_channel(&self) -> BusResult<Box<dyn BrokerChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(Box::new(LocalChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id: self.broker.next_id(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BusResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_connection(self.id);
        }
        Ok(())
    }
}

struct LocalChannel {
    broker: LocalBroker,
    connection: u64,
    id: u64,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl LocalChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BusError::Channel("channel already closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for LocalChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> BusResult<()> {
        self.ensure_open()?;
        if exchange.name.is_empty() {
            return Err(BusError::Topology(
                "ACCESS_REFUSED - the default exchange cannot be redeclared".into(),
            ));
        }
        let mut state = self.broker.state.lock();
        if let Some(existing) = state.exchanges.get(&exchange.name) {
            if existing == exchange {
                return Ok(());
            }
            return Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}': declared {:?}, requested {:?}",
                exchange.name, existing.kind, exchange.kind
            )));
        }
        state
            .exchanges
            .insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> BusResult<String> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !queue.name.is_empty() {
            if let Some(existing) = state.queues.get(&queue.name) {
                if existing.spec.exclusive && existing.owner != self.connection {
                    return Err(BusError::Topology(format!(
                        "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                        queue.name
                    )));
                }
                if existing.spec != *queue {
                    return Err(BusError::Topology(format!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        queue.name
                    )));
                }
                return Ok(queue.name.clone());
            }
        }

        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };
        let mut spec = queue.clone();
        spec.name = name.clone();
        state.queues.insert(
            name.clone(),
            LocalQueue {
                spec,
                owner: self.connection,
                backlog: VecDeque::new(),
                consumer: None,
                delivered: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()> {
        self.ensure_open()?;
        if pattern.len() > MAX_ROUTING_KEY_LEN {
            return Err(BusError::Channel(format!(
                "binding key is {} bytes, limit is {MAX_ROUTING_KEY_LEN}",
                pattern.len()
            )));
        }
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let duplicate = state.bindings.iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.pattern.as_str() == pattern
        });
        if !duplicate {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: TopicPattern::new(pattern),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        options: PublishOptions,
    ) -> BusResult<()> {
        self.ensure_open()?;
        if routing_key.len() > MAX_ROUTING_KEY_LEN {
            return Err(BusError::Publish(format!(
                "routing key is {} bytes, limit is {MAX_ROUTING_KEY_LEN}",
                routing_key.len()
            )));
        }
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        state.route(Envelope::new(routing_key, body), exchange, options);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<Deliveries> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Subscribe(format!("NOT_FOUND - no queue '{queue}'")))?;
        if target.spec.exclusive && target.owner != self.connection {
            return Err(BusError::Subscribe(format!(
                "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
            )));
        }
        if matches!(&target.consumer, Some(c) if !c.sender.is_closed()) {
            return Err(BusError::Subscribe(format!(
                "queue '{queue}' already has a consumer"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        while let Some(envelope) = target.backlog.pop_front() {
            // The receiver is alive, so this cannot fail.
            let _ = sender.send(Ok(envelope));
            target.delivered += 1;
        }
        target.consumer = Some(LocalConsumer {
            connection: self.connection,
            channel: self.id,
            sender,
        });
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> BusResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_channel(self.id);
        }
        Ok(())
    }
}
