//! Broadcast calls: one request, any number of replies within a window.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::client::Rpc;
use crate::error::{Result, RpcError};
use crate::message::{CorrelationId, ReplyResult};
use crate::registry::{Pending, Resolver};
use crate::router::CommandHandler;

/// What `on_complete` learns about a finished broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub command: String,
    pub correlation_id: CorrelationId,
    pub ttl: Duration,
    /// Outcomes delivered to `on_response`.
    pub responses: usize,
}

/// Callbacks and window for `Rpc::call_broadcast`.
pub struct BroadcastOptions {
    /// Collection window. Defaults to `RpcConfig::broadcast_ttl_ms`.
    pub ttl: Option<Duration>,
    /// Stop at the first response.
    pub auto_release: bool,
    on_response: Resolver,
    on_complete: Box<dyn FnOnce(BroadcastSummary) + Send>,
}

impl BroadcastOptions {
    pub fn new<R, C>(on_response: R, on_complete: C) -> Self
    where
        R: FnMut(ReplyResult) + Send + 'static,
        C: FnOnce(BroadcastSummary) + Send + 'static,
    {
        Self {
            ttl: None,
            auto_release: false,
            on_response: Box::new(on_response),
            on_complete: Box::new(on_complete),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_auto_release(mut self, auto_release: bool) -> Self {
        self.auto_release = auto_release;
        self
    }
}

impl fmt::Debug for BroadcastOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOptions")
            .field("ttl", &self.ttl)
            .field("auto_release", &self.auto_release)
            .finish_non_exhaustive()
    }
}

impl Rpc {
    /// Publish `params` to every responder of `command`.
    ///
    /// `on_response` runs for each reply arriving within the window;
    /// `on_complete` runs exactly once afterwards, even if nobody answered.
    pub async fn call_broadcast(
        &self,
        command: &str,
        params: impl Serialize,
        options: BroadcastOptions,
    ) -> CorrelationId {
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.inner.config.broadcast_ttl());
        let id = CorrelationId::new();

        let summary_command = command.to_string();
        let summary_id = id.clone();
        let on_complete = options.on_complete;
        let pending = Pending::Broadcast {
            on_response: options.on_response,
            on_complete: Box::new(move |responses| {
                debug!(command = %summary_command, responses, "Broadcast complete");
                on_complete(BroadcastSummary {
                    command: summary_command,
                    correlation_id: summary_id,
                    ttl,
                    responses,
                })
            }),
        };

        let payload = serde_json::to_vec(&params).map_err(RpcError::from);
        self.request(command, payload, id.clone(), ttl, options.auto_release, pending)
            .await;
        id
    }

    /// Broadcast and collect every outcome in arrival order once the window
    /// closes.
    pub async fn broadcast(
        &self,
        command: &str,
        params: impl Serialize,
        ttl: Option<Duration>,
    ) -> Vec<ReplyResult> {
        let (response_tx, mut responses) = mpsc::unbounded_channel();
        let (done_tx, done) = oneshot::channel();

        let mut options = BroadcastOptions::new(
            move |outcome| {
                let _ = response_tx.send(outcome);
            },
            move |summary| {
                let _ = done_tx.send(summary);
            },
        );
        options.ttl = ttl;

        self.call_broadcast(command, params, options).await;
        let _ = done.await;

        let mut collected = Vec::new();
        while let Ok(outcome) = responses.try_recv() {
            collected.push(outcome);
        }
        collected
    }

    /// Answer broadcasts of `pattern`. Unlike `on`, every process registered
    /// this way receives its own copy of each command.
    pub async fn on_broadcast<H>(&self, pattern: &str, handler: H) -> Result<bool>
    where
        H: CommandHandler + 'static,
    {
        self.inner
            .router
            .register_broadcast(pattern, Arc::new(handler))
            .await
    }
}
