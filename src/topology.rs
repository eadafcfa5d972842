//! Broker topology: connection, exchange, reply queue and command queues.
//!
//! Each resource is created lazily behind a `Gate`, in dependency order
//! (exchange needs the connection, the reply queue needs the exchange).
//! `disconnect` resets every gate so the next operation rebuilds from scratch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::gate::Gate;
use crate::identity::IdentitySource;
use crate::transport::{
    Broker, BrokerConnection, DeliveryHandler, ExchangeOptions, PublishOptions, QueueOptions,
};

/// A declared exchange on an open connection.
#[derive(Clone)]
pub struct Exchange {
    connection: Arc<dyn BrokerConnection>,
    name: String,
}

impl Exchange {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    #[tracing::instrument(
        name = "rpc.publish",
        skip_all,
        fields(exchange = %self.name, routing_key = %routing_key)
    )]
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()> {
        self.connection
            .publish(&self.name, routing_key, payload, options)
            .await
    }
}

/// The queue replies to this process arrive on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyQueue {
    pub name: String,
    pub consumer_tag: String,
}

/// Lazily established broker resources shared by every engine operation.
pub struct TopologyManager {
    broker: Option<Arc<dyn Broker>>,
    identity: Arc<dyn IdentitySource>,
    exchange_name: String,
    exchange_options: ExchangeOptions,
    reply_queue_options: QueueOptions,
    /// Exchange declared by someone else; skip our own declaration until the
    /// first disconnect.
    exchange_preexisting: AtomicBool,
    connection: Gate<Arc<dyn BrokerConnection>>,
    exchange: Gate<Exchange>,
    reply_queue: Gate<ReplyQueue>,
    command_queues: Mutex<HashMap<String, Arc<Gate<Exchange>>>>,
}

impl TopologyManager {
    pub fn new(
        broker: Option<Arc<dyn Broker>>,
        config: &RpcConfig,
        identity: Arc<dyn IdentitySource>,
    ) -> Self {
        Self {
            broker,
            identity,
            exchange_name: config.exchange.clone(),
            exchange_options: config.exchange_options,
            reply_queue_options: config.reply_queue,
            exchange_preexisting: AtomicBool::new(false),
            connection: Gate::new("connection"),
            exchange: Gate::new("exchange"),
            reply_queue: Gate::new("reply-queue"),
            command_queues: Mutex::new(HashMap::new()),
        }
    }

    /// Start with an already open connection.
    pub fn with_connection(mut self, connection: Arc<dyn BrokerConnection>) -> Self {
        self.connection = Gate::ready("connection", connection);
        self
    }

    /// Treat the configured exchange as already declared.
    pub fn with_existing_exchange(self) -> Self {
        self.exchange_preexisting.store(true, Ordering::SeqCst);
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn identity(&self) -> &Arc<dyn IdentitySource> {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_ready()
    }

    /// Name of the reply queue, once created.
    pub fn reply_queue_name(&self) -> Option<String> {
        self.reply_queue.get().map(|q| q.name)
    }

    fn command_queues(&self) -> MutexGuard<'_, HashMap<String, Arc<Gate<Exchange>>>> {
        self.command_queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn ensure_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.connection
            .get_or_try_init(|| async {
                let broker = self.broker.as_ref().ok_or_else(|| {
                    RpcError::Topology("No broker configured to open a connection".to_string())
                })?;
                let connection = broker.connect().await?;
                info!("Connected to broker");
                Ok(connection)
            })
            .await
    }

    pub async fn ensure_exchange(&self) -> Result<Exchange> {
        self.exchange
            .get_or_try_init(|| async {
                let connection = self.ensure_connection().await?;

                if self.exchange_preexisting.load(Ordering::SeqCst) {
                    debug!(exchange = %self.exchange_name, "Using existing exchange");
                } else {
                    connection
                        .declare_exchange(&self.exchange_name, &self.exchange_options)
                        .await?;
                    info!(exchange = %self.exchange_name, "Exchange declared");
                }

                Ok(Exchange {
                    connection,
                    name: self.exchange_name.clone(),
                })
            })
            .await
    }

    /// Declare, bind and subscribe this process's reply queue.
    ///
    /// `handler` is only used by the call that actually creates the queue.
    pub async fn ensure_reply_queue(&self, handler: Arc<dyn DeliveryHandler>) -> Result<ReplyQueue> {
        self.reply_queue
            .get_or_try_init(|| async {
                let exchange = self.ensure_exchange().await?;
                let connection = exchange.connection();
                let name = self.identity.queue_name("callback");

                connection
                    .declare_queue(&name, &self.reply_queue_options)
                    .await?;
                connection.bind_queue(&name, exchange.name(), &name).await?;
                let consumer_tag = connection.subscribe(&name, handler).await?;

                info!(queue = %name, "Reply queue ready");
                Ok(ReplyQueue { name, consumer_tag })
            })
            .await
    }

    /// Declare queue `name` and bind it under `routing_key`, once per name.
    pub async fn ensure_command_queue(
        &self,
        name: &str,
        routing_key: &str,
        options: &QueueOptions,
    ) -> Result<Exchange> {
        let gate = self
            .command_queues()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Gate::new(format!("queue:{}", name))))
            .clone();

        gate.get_or_try_init(|| async {
            let exchange = self.ensure_exchange().await?;
            let connection = exchange.connection();

            connection.declare_queue(name, options).await?;
            connection
                .bind_queue(name, exchange.name(), routing_key)
                .await?;

            debug!(queue = %name, routing_key = %routing_key, "Command queue bound");
            Ok(exchange)
        })
        .await
    }

    /// Drop the memo for `name` so the next `ensure_command_queue` redeclares it.
    pub fn forget_command_queue(&self, name: &str) {
        if let Some(gate) = self.command_queues().remove(name) {
            gate.reset();
        }
    }

    /// Close the connection and reset every gate.
    pub async fn disconnect(&self) {
        self.exchange_preexisting.store(false, Ordering::SeqCst);
        self.reply_queue.reset();
        self.exchange.reset();

        let queues: Vec<Arc<Gate<Exchange>>> =
            self.command_queues().drain().map(|(_, gate)| gate).collect();
        for gate in queues {
            gate.reset();
        }

        if let Some(connection) = self.connection.reset() {
            match connection.close().await {
                Ok(()) => info!("Disconnected from broker"),
                Err(e) => warn!(error = %e, "Error closing broker connection"),
            }
        }
    }
}
