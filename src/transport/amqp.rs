//! AMQP (RabbitMQ) transport.
//!
//! Connections come from a `deadpool-lapin` pool. Each connection keeps one
//! confirm-mode channel for declarations and publishes, plus one channel per
//! subscription so a slow handler never blocks the others.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Object, Pool, PoolError};
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Broker, BrokerConnection, Delivery, DeliveryHandler, DeliveryInfo, ExchangeOptions,
    PublishOptions, QueueOptions,
};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};

/// Opens pooled connections to RabbitMQ.
pub struct AmqpBroker {
    pool: Pool,
    connect_retries: usize,
}

impl AmqpBroker {
    /// Build the connection pool. No connection is opened until `connect`.
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &config.connection.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let manager = Manager::new(config.url.clone(), properties);
        let pool = Pool::builder(manager)
            .max_size(config.connection.pool_size)
            .build()
            .map_err(|e| RpcError::Config(format!("Failed to create pool: {}", e)))?;

        Ok(Self {
            pool,
            connect_retries: config.connection.connect_retries,
        })
    }

    async fn connect_once(&self) -> Result<AmqpConnection> {
        let connection = self.pool.get().await.map_err(|e: PoolError| {
            RpcError::Topology(format!("Failed to get connection from pool: {}", e))
        })?;
        let channel = open_channel(&connection).await?;

        Ok(AmqpConnection {
            connection,
            channel: Mutex::new(channel),
            subscriptions: StdMutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.connect_retries)
            .with_jitter()
            .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.connect_once().await {
                Ok(connection) => {
                    info!(attempt = attempt + 1, "Connected to AMQP");
                    return Ok(Arc::new(connection));
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = self.connect_retries,
                        error = %e,
                        "Failed to connect, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RpcError::Topology("Failed to connect to AMQP".to_string())))
    }
}

async fn open_channel(connection: &lapin::Connection) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| RpcError::Topology(format!("Failed to create channel: {}", e)))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| RpcError::Topology(format!("Failed to enable confirms: {}", e)))?;
    Ok(channel)
}

fn properties(options: &PublishOptions) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_content_type(options.content_type.as_str().into());
    if let Some(id) = &options.correlation_id {
        properties = properties.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &options.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    properties
}

fn delivery_info(
    exchange: &str,
    routing_key: &str,
    properties: &BasicProperties,
    size: usize,
) -> DeliveryInfo {
    DeliveryInfo {
        routing_key: routing_key.to_string(),
        exchange: exchange.to_string(),
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
        size,
        correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
    }
}

/// A pooled RabbitMQ connection.
pub struct AmqpConnection {
    connection: Object,
    /// Declarations and publishes. Replaced when the broker closes it after a
    /// failed operation.
    channel: Mutex<Channel>,
    /// consumer tag -> consuming channel
    subscriptions: StdMutex<HashMap<String, Channel>>,
}

impl AmqpConnection {
    async fn channel(&self) -> Result<Channel> {
        let mut channel = self.channel.lock().await;
        if !channel.status().connected() {
            debug!("Reopening AMQP channel");
            *channel = open_channel(&self.connection).await?;
        }
        Ok(channel.clone())
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Channel>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn consume(
        mut consumer: lapin::Consumer,
        queue: String,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Consumer delivery error");
                    break;
                }
            };

            let info = delivery_info(
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                &delivery.properties,
                delivery.data.len(),
            );
            let message = Delivery {
                payload: delivery.data.clone(),
                info,
            };
            let handled = AssertUnwindSafe(async { handler.handle(message).await })
                .catch_unwind()
                .await;
            if handled.is_err() {
                error!(queue = %queue, "Delivery handler panicked");
            }

            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(queue = %queue, error = %e, "Failed to ack message");
            }
        }
        debug!(queue = %queue, "Consumer stream ended");
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()> {
        self.channel()
            .await?
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<()> {
        self.channel()
            .await?
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Topology(format!("Failed to declare queue: {}", e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to bind queue: {}", e)))
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel()
            .await?
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to unbind queue: {}", e)))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel()
            .await?
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Topology(format!("Failed to delete queue: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()> {
        let channel = self
            .channel()
            .await
            .map_err(|e| RpcError::Publish(e.to_string()))?;

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..Default::default()
                },
                &payload,
                properties(&options),
            )
            .await
            .map_err(|e| RpcError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| RpcError::Publish(format!("Publish not confirmed: {}", e)))?;

        match confirmation {
            Confirmation::Nack(_) => Err(RpcError::Publish(format!(
                "Broker rejected message for '{}'",
                routing_key
            ))),
            Confirmation::Ack(Some(returned)) => {
                // Unroutable: no queue is bound for this key yet.
                warn!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply_code = returned.reply_code,
                    reply_text = %returned.reply_text.as_str(),
                    "Message returned by broker"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<String> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to create channel: {}", e)))?;

        let tag = format!("qpc-{}", Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to start consumer: {}", e)))?;

        self.subscriptions().insert(tag.clone(), channel);
        tokio::spawn(Self::consume(consumer, queue.to_string(), handler));

        info!(queue = %queue, consumer_tag = %tag, "Consumer started");
        Ok(tag)
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<()> {
        let Some(channel) = self.subscriptions().remove(consumer_tag) else {
            return Ok(());
        };

        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to cancel consumer: {}", e)))?;
        if let Err(e) = channel.close(200, "Consumer cancelled").await {
            debug!(consumer_tag = %consumer_tag, error = %e, "Error closing consumer channel");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.subscriptions().clear();
        self.connection
            .close(200, "Disconnecting")
            .await
            .map_err(|e| RpcError::Topology(format!("Failed to close connection: {}", e)))
    }
}
