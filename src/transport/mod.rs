//! Broker transport contract.
//!
//! This module contains:
//! - `Broker` trait: opens connections
//! - `BrokerConnection` trait: exchange/queue primitives, publish, subscribe
//! - `DeliveryHandler` trait: for processing inbound deliveries
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::Result;
use crate::message::{CorrelationId, CONTENT_TYPE_JSON};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

// ============================================================================
// Options
// ============================================================================

/// Exchange declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete once the last bound queue is unbound.
    pub auto_delete: bool,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Only usable by the declaring connection; deleted when it closes.
    pub exclusive: bool,
    /// Delete once the last consumer is cancelled.
    pub auto_delete: bool,
}

/// Per-message publish properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: String,
    pub correlation_id: Option<CorrelationId>,
    /// Routing key replies should be published under.
    pub reply_to: Option<String>,
    /// Ask the broker to return the message when no queue is bound for it.
    pub mandatory: bool,
}

impl PublishOptions {
    /// JSON payload with no correlation metadata.
    pub fn json() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            correlation_id: None,
            reply_to: None,
            mandatory: false,
        }
    }

    /// Request expecting a reply on `reply_to`.
    pub fn request(correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to.into()),
            mandatory: true,
            ..Self::json()
        }
    }

    /// Reply tagged with the caller's correlation id.
    pub fn reply(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::json()
        }
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Metadata the broker attaches to a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub routing_key: String,
    pub exchange: String,
    pub content_type: Option<String>,
    pub size: usize,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// An inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub info: DeliveryInfo,
}

/// Handler for deliveries on a subscribed queue.
///
/// Deliveries for one subscription are handled one at a time, in broker order.
pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()>;
}

impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        Box::pin(self(delivery))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Opens connections to a message broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MemoryBroker`: in-process broker for tests and single-process use
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection.
///
/// Declaration failures are reported as `RpcError::Topology`, publish
/// failures as `RpcError::Publish`.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Declare a topic exchange.
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()>;

    /// Declare a queue. Redeclaring an existing queue is not an error.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()>;

    /// Bind `queue` to `exchange` under a routing key or pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()>;

    /// Start consuming `queue`. Returns the consumer tag.
    async fn subscribe(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<String>;

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()>;

    /// Close the connection, cancelling every consumer opened on it.
    async fn close(&self) -> Result<()>;
}
