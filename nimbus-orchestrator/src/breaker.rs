//! Consecutive-failure circuit breaker wrapped around compute adapter calls.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use nimbus_common::CoreError;
use nimbus_providers::BackendError;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError<E> {
    /// Short-circuited; the wrapped call was not made.
    Open { retry_after: Duration },
    Inner(E),
}

impl From<CallError<BackendError>> for CoreError {
    fn from(e: CallError<BackendError>) -> Self {
        match e {
            CallError::Open { retry_after } => CoreError::CircuitOpen { retry_after },
            CallError::Inner(inner) => inner.into(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
    }

    /// Every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(f, |_| true).await
    }

    /// Only errors for which `counts` returns true are failures; the others
    /// are passed through and leave the counter alone.
    pub async fn call_with<T, E, F, Fut, C>(&self, f: F, counts: C) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.admit()?;
        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                if counts(&e) {
                    self.on_failure();
                } else {
                    self.on_success();
                }
                Err(CallError::Inner(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<(), CallError<E>> {
        let mut inner = self.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }
        let elapsed = inner.last_failure.map(|at| at.elapsed()).unwrap_or(self.reset_timeout);
        if elapsed >= self.reset_timeout {
            inner.state = BreakerState::HalfOpen;
            tracing::info!(breaker = %self.name, "circuit half-open, admitting trial call");
            Ok(())
        } else {
            Err(CallError::Open {
                retry_after: self.reset_timeout - elapsed,
            })
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        let trip = inner.state == BreakerState::HalfOpen || inner.failures >= self.threshold;
        if trip && inner.state != BreakerState::Open {
            tracing::warn!(breaker = %self.name, failures = inner.failures, "circuit opened");
        }
        if trip {
            inner.state = BreakerState::Open;
        }
    }
}
