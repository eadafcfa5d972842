//! Command handler registration and inbound dispatch.
//!
//! Every registered pattern owns one queue bound to the exchange under that
//! pattern and one subscription feeding the handler. Pattern syntax is handed
//! to the broker as-is; the router never matches routing keys itself.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::message::{decode_params, CommandInfo, CorrelationId, Reply};
use crate::topology::{Exchange, TopologyManager};
use crate::transport::{Delivery, DeliveryHandler, PublishOptions, QueueOptions};

/// Handler invoked for each command delivered to a registered pattern.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, params: Value, responder: Responder, info: CommandInfo)
        -> BoxFuture<'static, ()>;
}

impl<F, Fut> CommandHandler for F
where
    F: Fn(Value, Responder, CommandInfo) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(
        &self,
        params: Value,
        responder: Responder,
        info: CommandInfo,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self(params, responder, info))
    }
}

struct ReplyTarget {
    exchange: Exchange,
    reply_to: String,
    correlation_id: CorrelationId,
}

/// Sends the reply for one delivery.
///
/// Commands published without a reply address get a no-op responder; sending
/// through it does nothing. Not replying at all is also fine.
pub struct Responder {
    target: Option<ReplyTarget>,
}

impl Responder {
    pub fn noop() -> Self {
        Self { target: None }
    }

    fn replying(exchange: Exchange, reply_to: String, correlation_id: CorrelationId) -> Self {
        Self {
            target: Some(ReplyTarget {
                exchange,
                reply_to,
                correlation_id,
            }),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.target.as_ref().map(|t| &t.correlation_id)
    }

    /// Publish `reply` to the caller's reply address.
    pub async fn send(self, reply: Reply) -> Result<()> {
        let Some(target) = self.target else {
            debug!("No reply address, reply dropped");
            return Ok(());
        };

        let payload = reply.to_bytes()?;
        target
            .exchange
            .publish(
                &target.reply_to,
                payload,
                PublishOptions::reply(target.correlation_id),
            )
            .await
    }

    pub async fn ok(self, values: Vec<Value>) -> Result<()> {
        self.send(Reply::ok(values)).await
    }

    pub async fn value(self, value: impl Into<Value>) -> Result<()> {
        self.send(Reply::value(value)).await
    }

    pub async fn err(self, message: impl Into<String>) -> Result<()> {
        self.send(Reply::error(message)).await
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => f
                .debug_struct("Responder")
                .field("reply_to", &target.reply_to)
                .field("correlation_id", &target.correlation_id)
                .finish(),
            None => f.write_str("Responder(noop)"),
        }
    }
}

/// Turns raw deliveries into handler invocations.
struct Dispatcher {
    pattern: String,
    exchange: Exchange,
    handler: Arc<dyn CommandHandler>,
}

impl DeliveryHandler for Dispatcher {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        let info = CommandInfo::from(&delivery.info);
        let params = decode_params(&delivery.payload).unwrap_or_else(|fallback| {
            warn!(
                pattern = %self.pattern,
                command = %info.command,
                "Command payload is not JSON, passing it as a string"
            );
            fallback
        });

        let responder = match (delivery.info.correlation_id, delivery.info.reply_to) {
            (Some(id), Some(reply_to)) => {
                Responder::replying(self.exchange.clone(), reply_to, CorrelationId::from(id))
            }
            _ => Responder::noop(),
        };

        debug!(
            pattern = %self.pattern,
            command = %info.command,
            replying = !responder.is_noop(),
            "Dispatching command"
        );
        self.handler.handle(params, responder, info)
    }
}

struct CommandBinding {
    queue: String,
    routing_key: String,
    consumer_tag: String,
    exchange: Exchange,
}

/// Table of registered command patterns.
pub struct CommandRouter {
    topology: Arc<TopologyManager>,
    bindings: Mutex<HashMap<String, CommandBinding>>,
}

impl CommandRouter {
    pub fn new(topology: Arc<TopologyManager>) -> Self {
        Self {
            topology,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `handler` to `pattern` on a queue named after the pattern, shared
    /// with any other process registering the same pattern.
    ///
    /// Returns `Ok(false)` if the pattern is already registered.
    pub async fn register(&self, pattern: &str, handler: Arc<dyn CommandHandler>) -> Result<bool> {
        self.bind(pattern, pattern.to_string(), QueueOptions::default(), handler)
            .await
    }

    /// Bind `handler` to `pattern` on a queue private to this registration so
    /// every broadcast responder gets its own copy of each command.
    pub async fn register_broadcast(
        &self,
        pattern: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool> {
        let queue = self.topology.identity().queue_name("broadcast");
        let options = QueueOptions {
            exclusive: true,
            ..Default::default()
        };
        self.bind(pattern, queue, options, handler).await
    }

    async fn bind(
        &self,
        pattern: &str,
        queue: String,
        options: QueueOptions,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains_key(pattern) {
            debug!(pattern = %pattern, "Pattern already registered");
            return Ok(false);
        }

        let exchange = self
            .topology
            .ensure_command_queue(&queue, pattern, &options)
            .await?;

        let dispatcher = Arc::new(Dispatcher {
            pattern: pattern.to_string(),
            exchange: exchange.clone(),
            handler,
        });
        let consumer_tag = match exchange.connection().subscribe(&queue, dispatcher).await {
            Ok(tag) => tag,
            Err(e) => {
                self.topology.forget_command_queue(&queue);
                return Err(e);
            }
        };

        info!(pattern = %pattern, queue = %queue, "Handler registered");
        bindings.insert(
            pattern.to_string(),
            CommandBinding {
                queue,
                routing_key: pattern.to_string(),
                consumer_tag,
                exchange,
            },
        );
        Ok(true)
    }

    /// Tear down the binding for `pattern`: unsubscribe, unbind, delete the
    /// queue. Returns `false` if the pattern was not registered.
    ///
    /// A failing step is logged and the remaining steps still run.
    pub async fn deregister(&self, pattern: &str) -> bool {
        let mut bindings = self.bindings.lock().await;
        let Some(binding) = bindings.get(pattern) else {
            debug!(pattern = %pattern, "Pattern not registered");
            return false;
        };

        let connection = binding.exchange.connection();
        if let Err(e) = connection.unsubscribe(&binding.consumer_tag).await {
            warn!(pattern = %pattern, error = %e, "Failed to unsubscribe");
        }
        if let Err(e) = connection
            .unbind_queue(&binding.queue, binding.exchange.name(), &binding.routing_key)
            .await
        {
            warn!(pattern = %pattern, error = %e, "Failed to unbind queue");
        }
        if let Err(e) = connection.delete_queue(&binding.queue).await {
            warn!(pattern = %pattern, error = %e, "Failed to delete queue");
        }
        self.topology.forget_command_queue(&binding.queue);

        info!(pattern = %pattern, queue = %binding.queue, "Handler deregistered");
        bindings.remove(pattern);
        true
    }

    /// Forget every binding without touching the broker.
    pub async fn clear(&self) {
        self.bindings.lock().await.clear();
    }

    /// Currently registered patterns, sorted.
    pub async fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.bindings.lock().await.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Queue backing `pattern`, if registered.
    pub async fn queue_for(&self, pattern: &str) -> Option<String> {
        self.bindings
            .lock()
            .await
            .get(pattern)
            .map(|b| b.queue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::identity::HostIdentity;
    use crate::transport::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn router(broker: &MemoryBroker) -> (CommandRouter, Arc<TopologyManager>) {
        let topology = Arc::new(TopologyManager::new(
            Some(Arc::new(broker.clone())),
            &RpcConfig::default(),
            Arc::new(HostIdentity::new()),
        ));
        (CommandRouter::new(topology.clone()), topology)
    }

    type Seen = (Value, bool, CommandInfo);

    fn recording_handler() -> (Arc<dyn CommandHandler>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |params: Value, responder: Responder, info: CommandInfo| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((params, responder.is_noop(), info));
            }
        };
        (Arc::new(handler), rx)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_register_twice_keeps_one_queue() {
        let broker = MemoryBroker::new();
        let (router, _) = router(&broker);
        let (handler, _rx) = recording_handler();

        assert!(router.register("sum", handler.clone()).await.unwrap());
        assert!(!router.register("sum", handler).await.unwrap());

        assert_eq!(router.patterns().await, vec!["sum".to_string()]);
        assert_eq!(broker.consumer_count("sum"), 1);
        assert_eq!(broker.stats().queue_declarations, 1);
    }

    #[tokio::test]
    async fn test_deregister_tears_down_queue() {
        let broker = MemoryBroker::new();
        let (router, _) = router(&broker);
        let (handler, _rx) = recording_handler();

        assert!(!router.deregister("sum").await);
        router.register("sum", handler).await.unwrap();

        assert!(router.deregister("sum").await);
        assert!(!router.deregister("sum").await);
        assert!(!broker.queue_exists("sum"));
        assert!(router.patterns().await.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_deregister_keeps_binding() {
        let broker = MemoryBroker::new();
        let (router, _) = router(&broker);
        let (handler, _rx) = recording_handler();
        router.register("sum", handler.clone()).await.unwrap();

        broker.set_unbind_delay(Duration::from_millis(500));
        let interrupted =
            tokio::time::timeout(Duration::from_millis(50), router.deregister("sum")).await;
        assert!(interrupted.is_err());
        assert_eq!(router.patterns().await, vec!["sum".to_string()]);
        assert!(!router.register("sum", handler).await.unwrap());

        broker.set_unbind_delay(Duration::ZERO);
        assert!(router.deregister("sum").await);
        assert!(!broker.queue_exists("sum"));
        assert!(router.patterns().await.is_empty());
    }

    #[tokio::test]
    async fn test_fire_and_forget_gets_noop_responder() {
        let broker = MemoryBroker::new();
        let (router, topology) = router(&broker);
        let (handler, mut rx) = recording_handler();
        router.register("foo", handler).await.unwrap();

        let exchange = topology.ensure_exchange().await.unwrap();
        exchange
            .publish("foo", b"[1,2]".to_vec(), PublishOptions::json())
            .await
            .unwrap();

        let (params, noop, info) = next(&mut rx).await;
        assert_eq!(params, json!([1, 2]));
        assert!(noop);
        assert_eq!(info.command, "foo");
        assert_eq!(info.exchange, "rpc_exchange");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_non_json_payload_arrives_as_string() {
        let broker = MemoryBroker::new();
        let (router, topology) = router(&broker);
        let (handler, mut rx) = recording_handler();
        router.register("log", handler).await.unwrap();

        let exchange = topology.ensure_exchange().await.unwrap();
        exchange
            .publish("log", b"not json".to_vec(), PublishOptions::json())
            .await
            .unwrap();

        let (params, _, _) = next(&mut rx).await;
        assert_eq!(params, json!("not json"));
    }

    #[tokio::test]
    async fn test_reply_published_with_correlation_id() {
        let broker = MemoryBroker::new();
        let (router, topology) = router(&broker);
        let handler = |params: Value, responder: Responder, _info: CommandInfo| async move {
            let sum: i64 = params
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).sum())
                .unwrap_or_default();
            responder.value(sum).await.unwrap();
        };
        router.register("sum", Arc::new(handler)).await.unwrap();

        let exchange = topology.ensure_exchange().await.unwrap();
        let (tx, mut replies) = mpsc::unbounded_channel();
        let sink = move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery);
            }
        };
        let reply_queue = topology.ensure_reply_queue(Arc::new(sink)).await.unwrap();

        let id = CorrelationId::new();
        exchange
            .publish(
                "sum",
                b"[1,2]".to_vec(),
                PublishOptions::request(id.clone(), reply_queue.name.clone()),
            )
            .await
            .unwrap();

        let delivery = next(&mut replies).await;
        assert_eq!(delivery.info.correlation_id.as_deref(), Some(id.as_str()));
        let reply = Reply::from_bytes(&delivery.payload).unwrap();
        assert_eq!(reply, Reply::value(3));
    }

    #[tokio::test]
    async fn test_broadcast_registrations_get_private_queues() {
        let broker = MemoryBroker::new();
        let (router, _) = router(&broker);
        let (handler, _rx) = recording_handler();

        assert!(router
            .register_broadcast("ping", handler.clone())
            .await
            .unwrap());
        let queue = router.queue_for("ping").await.unwrap();
        assert!(queue.contains(":broadcast:"));
        assert!(broker.queue_exists(&queue));

        assert!(router.deregister("ping").await);
        assert!(!broker.queue_exists(&queue));
    }

    #[tokio::test]
    async fn test_register_fails_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_fail_connect(true);
        let (router, _) = router(&broker);
        let (handler, _rx) = recording_handler();

        assert!(router.register("sum", handler.clone()).await.is_err());
        assert!(router.patterns().await.is_empty());

        broker.set_fail_connect(false);
        assert!(router.register("sum", handler).await.unwrap());
    }

    #[tokio::test]
    async fn test_noop_responder_send_is_harmless() {
        let responder = Responder::noop();
        assert!(responder.correlation_id().is_none());
        assert!(responder.ok(vec![json!(1)]).await.is_ok());
    }
}
