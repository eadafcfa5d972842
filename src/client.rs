//! The RPC engine.
//!
//! `Rpc` ties the topology, the correlation registry and the command router
//! together. Cloning an `Rpc` is cheap and every clone drives the same
//! connection.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::identity::{HostIdentity, IdentitySource};
use crate::message::{CorrelationId, Reply, ReplyResult};
use crate::registry::{CorrelationRegistry, Pending, Registration};
use crate::router::{CommandHandler, CommandRouter};
use crate::topology::TopologyManager;
use crate::transport::{
    Broker, BrokerConnection, Delivery, DeliveryHandler, PublishOptions, QueueOptions,
};

/// Per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// How long to wait for the reply. Defaults to `RpcConfig::ttl_ms`.
    pub ttl: Option<Duration>,
    /// Use this correlation id instead of generating one.
    pub correlation_id: Option<CorrelationId>,
}

impl CallOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Routes replies arriving on the reply queue into the registry.
struct ReplySink {
    registry: CorrelationRegistry,
}

impl DeliveryHandler for ReplySink {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        match delivery.info.correlation_id {
            Some(id) => {
                let outcome = Reply::from_bytes(&delivery.payload).and_then(Reply::into_result);
                self.registry.resolve(&CorrelationId::from(id), outcome);
            }
            None => debug!(
                routing_key = %delivery.info.routing_key,
                "Reply without correlation id dropped"
            ),
        }
        Box::pin(async {})
    }
}

/// Builds an `Rpc` from configuration plus optional pre-existing resources.
pub struct RpcBuilder {
    config: RpcConfig,
    broker: Option<Arc<dyn Broker>>,
    connection: Option<Arc<dyn BrokerConnection>>,
    existing_exchange: bool,
    identity: Option<Arc<dyn IdentitySource>>,
}

impl RpcBuilder {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            broker: None,
            connection: None,
            existing_exchange: false,
            identity: None,
        }
    }

    /// Open connections through `broker` instead of the default AMQP broker.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use an already open connection. Unless a broker is supplied too, the
    /// engine cannot reconnect after `disconnect`.
    pub fn with_connection(mut self, connection: Arc<dyn BrokerConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// The configured exchange already exists; do not declare it.
    pub fn with_existing_exchange(mut self) -> Self {
        self.existing_exchange = true;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentitySource>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn build(self) -> Result<Rpc> {
        let broker = match (self.broker, &self.connection) {
            (Some(broker), _) => {
                self.config.validate_topology()?;
                Some(broker)
            }
            (None, Some(_)) => {
                self.config.validate_topology()?;
                None
            }
            (None, None) => {
                self.config.validate()?;
                Some(default_broker(&self.config)?)
            }
        };

        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(HostIdentity::new()));

        let mut topology = TopologyManager::new(broker, &self.config, identity);
        if let Some(connection) = self.connection {
            topology = topology.with_connection(connection);
        }
        if self.existing_exchange {
            topology = topology.with_existing_exchange();
        }
        let topology = Arc::new(topology);

        Ok(Rpc {
            inner: Arc::new(RpcInner {
                router: CommandRouter::new(topology.clone()),
                topology,
                registry: CorrelationRegistry::new(),
                config: self.config,
            }),
        })
    }
}

#[cfg(feature = "amqp")]
fn default_broker(config: &RpcConfig) -> Result<Arc<dyn Broker>> {
    Ok(Arc::new(crate::transport::AmqpBroker::new(config)?))
}

#[cfg(not(feature = "amqp"))]
fn default_broker(_config: &RpcConfig) -> Result<Arc<dyn Broker>> {
    Err(RpcError::Config(
        "No broker supplied and the amqp feature is disabled".to_string(),
    ))
}

pub(crate) struct RpcInner {
    pub(crate) config: RpcConfig,
    pub(crate) topology: Arc<TopologyManager>,
    pub(crate) registry: CorrelationRegistry,
    pub(crate) router: CommandRouter,
}

/// RPC engine over a topic exchange.
#[derive(Clone)]
pub struct Rpc {
    pub(crate) inner: Arc<RpcInner>,
}

impl Rpc {
    /// Engine using the default AMQP broker for `config.url`.
    pub fn new(config: RpcConfig) -> Result<Self> {
        RpcBuilder::new(config).build()
    }

    pub fn builder(config: RpcConfig) -> RpcBuilder {
        RpcBuilder::new(config)
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.inner.topology
    }

    /// Publish `params` to `command` without waiting for, or accepting, a
    /// reply. The command queue is created if needed so the message waits
    /// there until a handler registers.
    ///
    /// Failures are logged, not returned.
    pub async fn notify(&self, command: &str, params: impl Serialize) {
        if let Err(e) = self.try_notify(command, params).await {
            error!(command = %command, error = %e, "Fire-and-forget call failed");
        }
    }

    async fn try_notify(&self, command: &str, params: impl Serialize) -> Result<()> {
        let payload = serde_json::to_vec(&params)?;
        let exchange = self
            .inner
            .topology
            .ensure_command_queue(command, command, &QueueOptions::default())
            .await?;
        exchange
            .publish(command, payload, PublishOptions::json())
            .await
    }

    /// Call `command` and wait for its reply values.
    pub async fn call(&self, command: &str, params: impl Serialize) -> Result<Vec<Value>> {
        self.call_with_options(command, params, CallOptions::default())
            .await
    }

    pub async fn call_with_options(
        &self,
        command: &str,
        params: impl Serialize,
        options: CallOptions,
    ) -> Result<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        self.call_with(command, params, options, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await;
        // The sender only disappears without sending if the call was cancelled.
        rx.await.unwrap_or(Err(RpcError::Disconnected))
    }

    /// Call `command` and hand its single outcome to `resolver`: the reply,
    /// a publish or topology failure, or `RpcError::Timeout`.
    ///
    /// Returns once the request is published (or has failed); the returned
    /// id can be passed to `cancel`.
    pub async fn call_with<F>(
        &self,
        command: &str,
        params: impl Serialize,
        options: CallOptions,
        resolver: F,
    ) -> CorrelationId
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        let ttl = options.ttl.unwrap_or_else(|| self.inner.config.default_ttl());
        let id = options.correlation_id.unwrap_or_default();

        let mut resolver = Some(resolver);
        let pending = Pending::Single(Box::new(move |outcome| {
            if let Some(resolver) = resolver.take() {
                resolver(outcome);
            }
        }));

        let payload = serde_json::to_vec(&params).map_err(RpcError::from);
        self.request(command, payload, id.clone(), ttl, false, pending)
            .await;
        id
    }

    /// Register, then publish a request expecting replies on the reply queue.
    /// Every failure path ends in exactly one `pending` notification.
    pub(crate) async fn request(
        &self,
        command: &str,
        payload: Result<Vec<u8>>,
        id: CorrelationId,
        ttl: Duration,
        auto_release: bool,
        pending: Pending,
    ) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => return pending.fail(e),
        };

        let topology = &self.inner.topology;
        let sink = Arc::new(ReplySink {
            registry: self.inner.registry.clone(),
        });
        let reply_queue = match topology.ensure_reply_queue(sink).await {
            Ok(queue) => queue,
            Err(e) => return pending.fail(e),
        };
        let exchange = match topology.ensure_exchange().await {
            Ok(exchange) => exchange,
            Err(e) => return pending.fail(e),
        };

        let registration = Registration {
            command: command.to_string(),
            ttl,
            auto_release,
            pending,
        };
        if let Err(duplicate) = self.inner.registry.register(id.clone(), registration) {
            let error = RpcError::DuplicateCorrelation(duplicate.id.to_string());
            return duplicate.registration.pending.fail(error);
        }

        let options = PublishOptions::request(id.clone(), reply_queue.name);
        if let Err(e) = exchange.publish(command, payload, options).await {
            error!(command = %command, correlation_id = %id, error = %e, "Publish failed");
            self.inner.registry.fail(&id, e);
        } else {
            debug!(command = %command, correlation_id = %id, "Request published");
        }
    }

    /// Stop waiting for `id`. Its resolver never runs. Returns `false` if the
    /// call already completed.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.inner.registry.cancel(id)
    }

    /// Handle `pattern` (AMQP topic syntax) with `handler`. Processes
    /// registering the same pattern share its queue and take turns.
    ///
    /// Returns `Ok(false)` if this engine already handles `pattern`.
    pub async fn on<H>(&self, pattern: &str, handler: H) -> Result<bool>
    where
        H: CommandHandler + 'static,
    {
        self.inner.router.register(pattern, Arc::new(handler)).await
    }

    /// Stop handling `pattern`. Returns `false` if it was not registered.
    pub async fn off(&self, pattern: &str) -> bool {
        self.inner.router.deregister(pattern).await
    }

    pub async fn patterns(&self) -> Vec<String> {
        self.inner.router.patterns().await
    }

    /// Close the connection and forget all topology and handler bindings.
    /// The next operation reconnects. Calls still waiting for replies run
    /// into their timeouts.
    pub async fn disconnect(&self) {
        self.inner.router.clear().await;
        self.inner.topology.disconnect().await;
    }
}
