use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, BackendResult};

/// Cancellation token plus deadline carried by every adapter call.
///
/// Dropping the wrapped future on cancellation drops the in-flight I/O with
/// it (child processes are spawned with `kill_on_drop`, sockets are closed),
/// so cancellation reaches the external daemon.
#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Instant,
}

impl CallContext {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
        }
    }

    /// Fresh, uncancelled context. Handy in tests and one-shot startup checks.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(CancellationToken::new(), timeout)
    }

    /// Child context: cancelled with the parent, deadline never later than the parent's.
    pub fn child(&self, timeout: Duration) -> Self {
        let deadline = (Instant::now() + timeout).min(self.deadline);
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs `fut` until it completes, the token is cancelled or the deadline passes.
    pub async fn run<T, F>(&self, fut: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(BackendError::Cancelled),
            res = tokio::time::timeout_at(self.deadline, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(BackendError::DeadlineExceeded),
            },
        }
    }

    /// Sleeps for `d`, or fails early if the deadline would pass first.
    pub async fn sleep(&self, d: Duration) -> BackendResult<()> {
        let wake = Instant::now() + d;
        if wake > self.deadline {
            tokio::select! {
                _ = self.token.cancelled() => Err(BackendError::Cancelled),
                _ = tokio::time::sleep_until(self.deadline) => Err(BackendError::DeadlineExceeded),
            }
        } else {
            tokio::select! {
                _ = self.token.cancelled() => Err(BackendError::Cancelled),
                _ = tokio::time::sleep_until(wake) => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_surfaces_as_error() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let res: BackendResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(res, Err(BackendError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let token = CancellationToken::new();
        let ctx = CallContext::new(token.clone(), Duration::from_secs(60));
        token.cancel();
        let res = ctx.run(std::future::pending::<BackendResult<()>>()).await;
        assert_eq!(res, Err(BackendError::Cancelled));
        assert!(ctx.child(Duration::from_secs(1)).is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn child_deadline_is_capped() {
        let parent = CallContext::with_timeout(Duration::from_secs(1));
        let child = parent.child(Duration::from_secs(30));
        assert!(child.deadline() <= parent.deadline());
        assert_eq!(child.sleep(Duration::from_secs(2)).await, Err(BackendError::DeadlineExceeded));
    }
}
