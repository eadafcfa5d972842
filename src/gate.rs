//! Memoized asynchronous initialization.
//!
//! A `Gate` runs its initializer at most once at a time. The first caller
//! performs the work; callers arriving while it is in flight queue up and are
//! handed the same outcome, in arrival order, once it completes. Success is
//! cached until `reset`; failure returns the gate to idle so the next caller
//! retries from scratch.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

type Waiter<T> = oneshot::Sender<Result<T>>;

enum Stage<T> {
    Idle,
    InFlight(Vec<Waiter<T>>),
    Ready(T),
}

struct State<T> {
    /// Bumped by `reset` so a stale in-flight initializer cannot publish its
    /// result into the new generation.
    generation: u64,
    stage: Stage<T>,
}

pub struct Gate<T> {
    name: String,
    state: Mutex<State<T>>,
}

impl<T: Clone> Gate<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                generation: 0,
                stage: Stage::Idle,
            }),
        }
    }

    /// A gate that starts out already initialized.
    pub fn ready(name: impl Into<String>, value: T) -> Self {
        let gate = Self::new(name);
        gate.lock().stage = Stage::Ready(value);
        gate
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cached value, if initialization has completed.
    pub fn get(&self) -> Option<T> {
        match &self.lock().stage {
            Stage::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.lock().stage, Stage::Ready(_))
    }

    /// Return the cached value, join an in-flight initialization, or run
    /// `init` if neither exists.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (generation, waiter) = {
            let mut state = self.lock();
            let generation = state.generation;
            match &mut state.stage {
                Stage::Ready(value) => return Ok(value.clone()),
                Stage::InFlight(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    (generation, Some(rx))
                }
                Stage::Idle => {
                    state.stage = Stage::InFlight(Vec::new());
                    (generation, None)
                }
            }
        };

        if let Some(rx) = waiter {
            debug!(gate = %self.name, "Joining in-flight initialization");
            return rx.await.unwrap_or(Err(RpcError::Disconnected));
        }

        let mut guard = InitGuard {
            gate: self,
            generation,
            armed: true,
        };
        let result = init().await;
        guard.armed = false;

        self.complete(generation, &result);
        result
    }

    fn complete(&self, generation: u64, result: &Result<T>) {
        let waiters = {
            let mut state = self.lock();
            if state.generation != generation {
                // Reset while in flight; those waiters were already released.
                Vec::new()
            } else {
                let next = match result {
                    Ok(value) => Stage::Ready(value.clone()),
                    Err(_) => Stage::Idle,
                };
                match std::mem::replace(&mut state.stage, next) {
                    Stage::InFlight(waiters) => waiters,
                    _ => Vec::new(),
                }
            }
        };

        match result {
            Ok(_) => debug!(gate = %self.name, waiters = waiters.len(), "Initialized"),
            Err(e) => warn!(
                gate = %self.name,
                waiters = waiters.len(),
                error = %e,
                "Initialization failed"
            ),
        }

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Forget any cached value and release in-flight waiters with
    /// `RpcError::Disconnected`. Returns the value that was cached.
    pub fn reset(&self) -> Option<T> {
        let (previous, waiters) = {
            let mut state = self.lock();
            state.generation += 1;
            match std::mem::replace(&mut state.stage, Stage::Idle) {
                Stage::Ready(value) => (Some(value), Vec::new()),
                Stage::InFlight(waiters) => (None, waiters),
                Stage::Idle => (None, Vec::new()),
            }
        };

        for waiter in waiters {
            let _ = waiter.send(Err(RpcError::Disconnected));
        }
        previous
    }

    /// Release the gate when the initializing future is dropped mid-flight.
    fn abandon(&self, generation: u64) {
        let waiters = {
            let mut state = self.lock();
            if state.generation != generation || !matches!(state.stage, Stage::InFlight(_)) {
                return;
            }
            match std::mem::replace(&mut state.stage, Stage::Idle) {
                Stage::InFlight(waiters) => waiters,
                _ => Vec::new(),
            }
        };

        warn!(gate = %self.name, waiters = waiters.len(), "Initialization abandoned");
        for waiter in waiters {
            let _ = waiter.send(Err(RpcError::Disconnected));
        }
    }
}

struct InitGuard<'a, T: Clone> {
    gate: &'a Gate<T>,
    generation: u64,
    armed: bool,
}

impl<T: Clone> Drop for InitGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abandon(self.generation);
        }
    }
}
