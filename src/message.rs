//! Wire-level message types.
//!
//! Requests are plain JSON documents. Replies travel in a tagged envelope so a
//! remote failure is distinguishable from a successful reply carrying values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, RpcError};
use crate::transport::DeliveryInfo;

/// Content type stamped on every request and reply.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Opaque token matching a reply to the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Outcome delivered to a resolver: the reply values, or why there are none.
pub type ReplyResult = Result<Vec<Value>>;

/// Reply envelope published by command handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    /// Ordered reply values.
    Ok { values: Vec<Value> },
    /// Handler-reported failure.
    Error { message: String },
}

impl Reply {
    pub fn ok(values: Vec<Value>) -> Self {
        Reply::Ok { values }
    }

    /// Reply with exactly one value.
    pub fn value(value: impl Into<Value>) -> Self {
        Reply::Ok {
            values: vec![value.into()],
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a reply payload.
    ///
    /// Payloads that are valid JSON but not an envelope are accepted as a
    /// successful reply: an array becomes the value list, anything else a
    /// single value.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        if let Ok(reply) = serde_json::from_slice::<Reply>(payload) {
            return Ok(reply);
        }

        let value: Value = serde_json::from_slice(payload)?;
        Ok(match value {
            Value::Array(values) => Reply::Ok { values },
            other => Reply::Ok {
                values: vec![other],
            },
        })
    }

    pub fn into_result(self) -> ReplyResult {
        match self {
            Reply::Ok { values } => Ok(values),
            Reply::Error { message } => Err(RpcError::Remote(message)),
        }
    }
}

/// Describes the delivery a command handler is being invoked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    /// Routing key the command was published under (the concrete name, even
    /// when the handler was registered with a wildcard pattern).
    pub command: String,
    /// Exchange the command arrived through.
    pub exchange: String,
    pub content_type: Option<String>,
    /// Payload size in bytes.
    pub size: usize,
}

impl From<&DeliveryInfo> for CommandInfo {
    fn from(info: &DeliveryInfo) -> Self {
        Self {
            command: info.routing_key.clone(),
            exchange: info.exchange.clone(),
            content_type: info.content_type.clone(),
            size: info.size,
        }
    }
}

/// Decode request parameters.
///
/// Non-JSON payloads are surfaced as a string so the handler still runs.
pub(crate) fn decode_params(payload: &[u8]) -> std::result::Result<Value, Value> {
    serde_json::from_slice(payload)
        .map_err(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
