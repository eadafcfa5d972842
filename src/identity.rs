//! Queue naming.

use uuid::Uuid;

/// Supplies names for queues that must not collide with any other process
/// attached to the same broker.
pub trait IdentitySource: Send + Sync {
    /// Generate a fresh queue name for the given purpose (`callback`,
    /// `broadcast`, ...).
    fn queue_name(&self, kind: &str) -> String;
}

/// Names queues `<hostname>:pid<pid>:<kind>:<random hex>`.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    host: String,
    pid: u32,
}

impl HostIdentity {
    pub fn new() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            host,
            pid: std::process::id(),
        }
    }
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySource for HostIdentity {
    fn queue_name(&self, kind: &str) -> String {
        format!(
            "{}:pid{}:{}:{}",
            self.host,
            self.pid,
            kind,
            Uuid::new_v4().simple()
        )
    }
}
