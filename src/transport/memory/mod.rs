//! In-memory broker for standalone mode and tests.
//!
//! Mirrors the parts of AMQP topic-exchange semantics the engine relies on:
//! pattern bindings, per-queue buffering while nobody consumes, round-robin
//! delivery across the consumers of one queue, exclusive queues dropped with
//! their connection. Failure switches let tests exercise error paths.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    Broker, BrokerConnection, Delivery, DeliveryHandler, DeliveryInfo, ExchangeOptions,
    PublishOptions, QueueOptions,
};
use crate::error::{Result, RpcError};

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules (AMQP topic exchange):
/// - words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&head, tail)) => (word == "*" || word == head) && matches(rest, tail),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Counters exposed for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: usize,
    pub exchange_declarations: usize,
    pub queue_declarations: usize,
    pub published: usize,
}

struct ExchangeState {
    options: ExchangeOptions,
    /// (queue, pattern)
    bindings: Vec<(String, String)>,
}

struct Consumer {
    tag: String,
    connection: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    buffer: VecDeque<Delivery>,
    consumers: Vec<Consumer>,
    next: usize,
}

impl QueueState {
    /// Hand a delivery to the next live consumer, or buffer it.
    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next % self.consumers.len();
            self.next = self.next.wrapping_add(1);
            match self.consumers[index].tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        self.buffer.push_back(delivery);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    stats: BrokerStats,
}

impl BrokerState {
    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }
}

#[derive(Default)]
struct Faults {
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    connect_delay_ms: AtomicU64,
    unbind_delay_ms: AtomicU64,
}

/// In-process broker. Clones share the same exchanges and queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    faults: Arc<Faults>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent connection attempts fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.faults.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent publishes fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.faults.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delay every connection attempt, widening the window for concurrent
    /// first-use callers.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.faults
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every unbind, leaving queue teardown half done for a while.
    pub fn set_unbind_delay(&self, delay: Duration) {
        self.faults
            .unbind_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of bindings for `queue` across all exchanges.
    pub fn binding_count(&self, queue: &str) -> usize {
        self.lock()
            .exchanges
            .values()
            .map(|e| e.bindings.iter().filter(|(q, _)| q == queue).count())
            .sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Messages waiting for a consumer.
    pub fn buffered(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.buffer.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let delay = self.faults.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.faults.fail_connect.load(Ordering::SeqCst) {
            return Err(RpcError::Topology(
                "Failed to connect: connection refused".to_string(),
            ));
        }

        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.lock().stats.connections += 1;
        info!(connection = id, "Connected to in-memory broker");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection handle onto a `MemoryBroker`.
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Topology("Connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.stats.exchange_declarations += 1;

        match state.exchanges.get(name) {
            Some(existing) if existing.options != *options => Err(RpcError::Topology(format!(
                "PRECONDITION_FAILED - cannot redeclare exchange '{}' with different options",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        options: *options,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = %name, "Exchange declared");
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.stats.queue_declarations += 1;

        let owner = self.id;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                options: *options,
                owner,
                buffer: VecDeque::new(),
                consumers: Vec::new(),
                next: 0,
            });
        debug!(queue = %name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if !state.queues.contains_key(queue) {
            return Err(RpcError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RpcError::Topology(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Queue bound");
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let delay = self.broker.faults.unbind_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut state = self.broker.lock();

        if !state.queues.contains_key(queue) {
            return Err(RpcError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if let Some(exchange_state) = state.exchanges.get_mut(exchange) {
            exchange_state
                .bindings
                .retain(|(q, key)| !(q == queue && key == routing_key));
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().remove_queue(name);
        debug!(queue = %name, "Queue deleted");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()> {
        self.ensure_open()
            .map_err(|e| RpcError::Publish(e.to_string()))?;
        if self.broker.faults.fail_publish.load(Ordering::SeqCst) {
            return Err(RpcError::Publish("Broker rejected publish".to_string()));
        }

        let mut state = self.broker.lock();
        let targets: Vec<String> = {
            let exchange_state = state.exchanges.get(exchange).ok_or_else(|| {
                RpcError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let mut targets: Vec<String> = Vec::new();
            for (queue, pattern) in &exchange_state.bindings {
                if topic_matches(pattern, routing_key) && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };
        state.stats.published += 1;

        if targets.is_empty() {
            debug!(
                exchange = %exchange,
                routing_key = %routing_key,
                mandatory = options.mandatory,
                "Unroutable message dropped"
            );
            return Ok(());
        }

        let delivery = Delivery {
            info: DeliveryInfo {
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
                content_type: Some(options.content_type),
                size: payload.len(),
                correlation_id: options.correlation_id.map(|id| id.to_string()),
                reply_to: options.reply_to,
            },
            payload,
        };

        for queue in targets {
            if let Some(queue_state) = state.queues.get_mut(&queue) {
                queue_state.deliver(delivery.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<String> {
        self.ensure_open()?;
        let tag = format!("memory-{}", Uuid::new_v4().simple());
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        {
            let mut state = self.broker.lock();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| RpcError::Topology(format!("NOT_FOUND - no queue '{}'", queue)))?;

            queue_state.consumers.push(Consumer {
                tag: tag.clone(),
                connection: self.id,
                tx,
            });
            let backlog: Vec<Delivery> = queue_state.buffer.drain(..).collect();
            for delivery in backlog {
                queue_state.deliver(delivery);
            }
        }

        let consumer_queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let handled = AssertUnwindSafe(async { handler.handle(delivery).await })
                    .catch_unwind()
                    .await;
                if handled.is_err() {
                    error!(queue = %consumer_queue, "Delivery handler panicked");
                }
            }
        });

        debug!(queue = %queue, consumer_tag = %tag, "Consumer started");
        Ok(tag)
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        let mut emptied = None;
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.tag != consumer_tag);
            if queue.consumers.len() != before {
                if queue.consumers.is_empty() && queue.options.auto_delete {
                    emptied = Some(name.clone());
                }
                break;
            }
        }

        if let Some(name) = emptied {
            debug!(queue = %name, "Auto-delete queue lost its last consumer");
            state.remove_queue(&name);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.lock();
        let id = self.id;
        let mut doomed = Vec::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.connection != id);
            let orphaned =
                before > 0 && queue.consumers.is_empty() && queue.options.auto_delete;
            if (queue.options.exclusive && queue.owner == id) || orphaned {
                doomed.push(name.clone());
            }
        }
        for name in doomed {
            state.remove_queue(&name);
        }

        info!(connection = id, "In-memory broker connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
