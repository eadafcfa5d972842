//! Correlation registry.
//!
//! Tracks calls that expect replies, keyed by correlation id. Each entry owns
//! a TTL timer. Single-mode entries resolve exactly once (reply, failure or
//! timeout); broadcast entries collect replies until their timer fires and
//! then run their completion exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::message::{CorrelationId, ReplyResult};

/// Callback receiving each outcome for an entry.
pub type Resolver = Box<dyn FnMut(ReplyResult) + Send>;

/// Broadcast completion, called with the number of outcomes delivered.
pub type Completion = Box<dyn FnOnce(usize) + Send>;

/// How many outcomes an entry expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Broadcast,
}

/// The callbacks an entry resolves through.
pub enum Pending {
    /// Exactly one outcome.
    Single(Resolver),
    /// Any number of responses, then one completion.
    Broadcast {
        on_response: Resolver,
        on_complete: Completion,
    },
}

impl Pending {
    pub fn mode(&self) -> Mode {
        match self {
            Pending::Single(_) => Mode::Single,
            Pending::Broadcast { .. } => Mode::Broadcast,
        }
    }

    /// Deliver a terminal failure without ever registering.
    pub fn fail(self, error: RpcError) {
        match self {
            Pending::Single(mut resolver) => resolver(Err(error)),
            Pending::Broadcast {
                mut on_response,
                on_complete,
            } => {
                on_response(Err(error));
                on_complete(1);
            }
        }
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pending").field(&self.mode()).finish()
    }
}

/// Everything needed to register an expected reply.
#[derive(Debug)]
pub struct Registration {
    /// Command the call was made for; reported in timeouts.
    pub command: String,
    pub ttl: Duration,
    /// Release the entry on the first outcome even in broadcast mode.
    pub auto_release: bool,
    pub pending: Pending,
}

/// Returned by `register` when the id is taken. Hands the registration back so
/// the caller can still fail it.
#[derive(Debug)]
pub struct DuplicateCorrelation {
    pub id: CorrelationId,
    pub registration: Registration,
}

impl From<DuplicateCorrelation> for RpcError {
    fn from(e: DuplicateCorrelation) -> Self {
        RpcError::DuplicateCorrelation(e.id.to_string())
    }
}

struct Callbacks {
    resolver: Resolver,
    completion: Option<Completion>,
    delivered: usize,
}

/// Callback state shared between the table and whoever is resolving.
///
/// `closed` is flipped by whichever path ends the entry; `callbacks` serializes
/// invocations so a completion never overlaps a response.
struct Slot {
    closed: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Slot {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Entry {
    mode: Mode,
    auto_release: bool,
    command: String,
    ttl: Duration,
    generation: u64,
    slot: Arc<Slot>,
    timer: AbortHandle,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<CorrelationId, Entry>>,
    generations: AtomicU64,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<CorrelationId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expire(&self, id: &CorrelationId, generation: u64) {
        let entry = {
            let mut entries = self.entries();
            if entries.get(id).map(|e| e.generation) == Some(generation) {
                entries.remove(id)
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            return;
        };

        let mut callbacks = entry.slot.callbacks();
        if entry.slot.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match entry.mode {
            Mode::Single => {
                debug!(correlation_id = %id, command = %entry.command, "Call timed out");
                (callbacks.resolver)(Err(RpcError::Timeout {
                    command: entry.command.clone(),
                    ttl: entry.ttl,
                }));
            }
            Mode::Broadcast => {
                let delivered = callbacks.delivered;
                debug!(
                    correlation_id = %id,
                    command = %entry.command,
                    responses = delivered,
                    "Broadcast window closed"
                );
                if let Some(completion) = callbacks.completion.take() {
                    completion(delivered);
                }
            }
        }
    }
}

/// Table of outstanding calls. Clones share the same table.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    inner: Arc<Inner>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expected reply and arm its TTL timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        id: CorrelationId,
        registration: Registration,
    ) -> std::result::Result<(), DuplicateCorrelation> {
        let mut entries = self.inner.entries();
        if entries.contains_key(&id) {
            warn!(correlation_id = %id, "Duplicate correlation id rejected");
            return Err(DuplicateCorrelation { id, registration });
        }

        let Registration {
            command,
            ttl,
            auto_release,
            pending,
        } = registration;
        let mode = pending.mode();
        let (resolver, completion) = match pending {
            Pending::Single(resolver) => (resolver, None),
            Pending::Broadcast {
                on_response,
                on_complete,
            } => (on_response, Some(on_complete)),
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_id, generation);
            }
        })
        .abort_handle();

        debug!(correlation_id = %id, command = %command, ?mode, ttl_ms = ttl.as_millis() as u64, "Registered");
        entries.insert(
            id,
            Entry {
                mode,
                auto_release,
                command,
                ttl,
                generation,
                slot: Arc::new(Slot {
                    closed: AtomicBool::new(false),
                    callbacks: Mutex::new(Callbacks {
                        resolver,
                        completion,
                        delivered: 0,
                    }),
                }),
                timer,
            },
        );
        Ok(())
    }

    /// Deliver an outcome for `id`.
    ///
    /// Returns `false` when no entry is registered (late or unmatched
    /// delivery), in which case nothing happens.
    pub fn resolve(&self, id: &CorrelationId, outcome: ReplyResult) -> bool {
        let (slot, release) = {
            let mut entries = self.inner.entries();
            let Some(entry) = entries.get(id) else {
                debug!(correlation_id = %id, "Dropping reply for unknown correlation id");
                return false;
            };
            let release = entry.mode == Mode::Single || entry.auto_release;
            let slot = entry.slot.clone();
            if release {
                if let Some(entry) = entries.remove(id) {
                    entry.timer.abort();
                }
            }
            (slot, release)
        };

        let mut callbacks = slot.callbacks();
        if slot.closed.load(Ordering::SeqCst) {
            debug!(correlation_id = %id, "Dropping reply that lost the race with expiry");
            return false;
        }
        if release {
            slot.closed.store(true, Ordering::SeqCst);
        }

        (callbacks.resolver)(outcome);
        callbacks.delivered += 1;

        if release {
            let delivered = callbacks.delivered;
            if let Some(completion) = callbacks.completion.take() {
                completion(delivered);
            }
        }
        true
    }

    /// Remove `id` and deliver `error` as its terminal outcome. Broadcast
    /// entries receive the error as a response and then complete.
    pub fn fail(&self, id: &CorrelationId, error: RpcError) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };

        let mut callbacks = entry.slot.callbacks();
        if entry.slot.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        (callbacks.resolver)(Err(error));
        callbacks.delivered += 1;
        let delivered = callbacks.delivered;
        if let Some(completion) = callbacks.completion.take() {
            completion(delivered);
        }
        true
    }

    /// Remove `id` without invoking any of its callbacks.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        match self.take(id) {
            Some(entry) => {
                entry.slot.closed.store(true, Ordering::SeqCst);
                debug!(correlation_id = %id, "Cancelled");
                true
            }
            None => false,
        }
    }

    fn take(&self, id: &CorrelationId) -> Option<Entry> {
        let entry = self.inner.entries().remove(id)?;
        entry.timer.abort();
        Some(entry)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.entries().contains_key(id)
    }

    pub fn mode(&self, id: &CorrelationId) -> Option<Mode> {
        self.inner.entries().get(id).map(|e| e.mode)
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn single(
        command: &str,
        ttl: Duration,
    ) -> (Registration, mpsc::UnboundedReceiver<ReplyResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = Registration {
            command: command.to_string(),
            ttl,
            auto_release: false,
            pending: Pending::Single(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        };
        (registration, rx)
    }

    fn broadcast(
        ttl: Duration,
        auto_release: bool,
    ) -> (
        Registration,
        mpsc::UnboundedReceiver<ReplyResult>,
        mpsc::UnboundedReceiver<usize>,
    ) {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        let registration = Registration {
            command: "ping".to_string(),
            ttl,
            auto_release,
            pending: Pending::Broadcast {
                on_response: Box::new(move |outcome| {
                    let _ = response_tx.send(outcome);
                }),
                on_complete: Box::new(move |count| {
                    let _ = complete_tx.send(count);
                }),
            },
        };
        (registration, response_rx, complete_rx)
    }

    #[tokio::test]
    async fn test_single_resolves_once_and_releases() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let (registration, mut rx) = single("sum", Duration::from_secs(5));
        registry.register(id.clone(), registration).unwrap();

        assert!(registry.resolve(&id, Ok(vec![json!(3)])));
        assert!(!registry.resolve(&id, Ok(vec![json!(4)])));
        assert!(registry.is_empty());

        assert_eq!(rx.recv().await, Some(Ok(vec![json!(3)])));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.resolve(&CorrelationId::new(), Ok(vec![])));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_side_effects() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from("fixed");
        let (first, mut first_rx) = single("a", Duration::from_secs(5));
        let (second, _second_rx) = single("b", Duration::from_secs(5));

        registry.register(id.clone(), first).unwrap();
        let err = registry.register(id.clone(), second).unwrap_err();
        assert_eq!(err.registration.command, "b");
        assert_eq!(
            RpcError::from(err),
            RpcError::DuplicateCorrelation("fixed".to_string())
        );

        assert_eq!(registry.len(), 1);
        registry.resolve(&id, Ok(vec![Value::Null]));
        assert_eq!(first_rx.recv().await, Some(Ok(vec![Value::Null])));
    }

    #[tokio::test]
    async fn test_single_times_out() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let (registration, mut rx) = single("timeout", Duration::from_millis(50));
        registry.register(id.clone(), registration).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.unwrap_err().is_timeout());
        assert!(!registry.contains(&id));
        assert!(!registry.resolve(&id, Ok(vec![])));
    }

    #[tokio::test]
    async fn test_broadcast_accumulates_until_expiry() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let (registration, mut responses, mut completions) =
            broadcast(Duration::from_millis(100), false);
        registry.register(id.clone(), registration).unwrap();
        assert_eq!(registry.mode(&id), Some(Mode::Broadcast));

        for n in 0..3 {
            assert!(registry.resolve(&id, Ok(vec![json!(n)])));
        }
        assert!(registry.contains(&id));

        let count = tokio::time::timeout(Duration::from_secs(1), completions.recv())
            .await
            .unwrap();
        assert_eq!(count, Some(3));
        for n in 0..3 {
            assert_eq!(responses.recv().await, Some(Ok(vec![json!(n)])));
        }

        assert!(!registry.resolve(&id, Ok(vec![json!("late")])));
        assert!(responses.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_with_no_responses_still_completes() {
        let registry = CorrelationRegistry::new();
        let (registration, _responses, mut completions) =
            broadcast(Duration::from_millis(30), false);
        registry.register(CorrelationId::new(), registration).unwrap();

        let count = tokio::time::timeout(Duration::from_secs(1), completions.recv())
            .await
            .unwrap();
        assert_eq!(count, Some(0));
    }

    #[tokio::test]
    async fn test_broadcast_auto_release_completes_on_first_response() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let (registration, _responses, mut completions) =
            broadcast(Duration::from_secs(5), true);
        registry.register(id.clone(), registration).unwrap();

        assert!(registry.resolve(&id, Ok(vec![json!("first")])));
        assert!(!registry.contains(&id));
        assert_eq!(completions.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_fail_broadcast_responds_then_completes() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let (registration, mut responses, mut completions) =
            broadcast(Duration::from_secs(5), false);
        registry.register(id.clone(), registration).unwrap();

        assert!(registry.fail(&id, RpcError::Publish("nack".to_string())));
        assert_eq!(
            responses.recv().await,
            Some(Err(RpcError::Publish("nack".to_string())))
        );
        assert_eq!(completions.recv().await, Some(1));
        assert!(!registry.fail(&id, RpcError::Disconnected));
    }

    #[tokio::test]
    async fn test_cancel_suppresses_timeout() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let (registration, mut rx) = single("slow", Duration::from_millis(30));
        registry.register(id.clone(), registration).unwrap();

        assert!(registry.cancel(&id));
        assert!(!registry.cancel(&id));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reregistered_id_not_expired_by_stale_timer() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::from("reused");
        let calls = Arc::new(AtomicUsize::new(0));

        let (first, _rx) = single("first", Duration::from_millis(30));
        registry.register(id.clone(), first).unwrap();
        registry.cancel(&id);

        let seen = calls.clone();
        registry
            .register(
                id.clone(),
                Registration {
                    command: "second".to_string(),
                    ttl: Duration::from_secs(5),
                    auto_release: false,
                    pending: Pending::Single(Box::new(move |_| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    })),
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.contains(&id));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
