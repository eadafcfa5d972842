//! qpc - RPC over a topic-exchange message broker
//!
//! Request/reply, fire-and-forget and broadcast calls layered on a RabbitMQ
//! style topic exchange. Replies are matched to calls by correlation id and
//! arrive on a per-process reply queue; every call resolves exactly once,
//! by reply, failure or timeout.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod message;
pub mod registry;
pub mod router;
pub mod topology;
pub mod transport;
pub mod utils;

pub use broadcast::{BroadcastOptions, BroadcastSummary};
pub use client::{CallOptions, Rpc, RpcBuilder};
pub use config::RpcConfig;
pub use error::{Result, RpcError};
pub use message::{CommandInfo, CorrelationId, Reply, ReplyResult};
pub use router::{CommandHandler, Responder};
