//! Cancellation and deadlines for cluster I/O.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Passed into every cluster call. Cloning shares the same token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// No deadline; cancelled only through [`CallContext::cancel`].
    pub fn background() -> Self { Self::default() }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { token: CancellationToken::new(), deadline: Some(Instant::now() + timeout) }
    }

    /// Child context: cancelled with its parent, may carry a tighter deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { token: self.token.child_token(), deadline }
    }

    pub fn cancel(&self) { self.token.cancel(); }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    /// Drive `fut` until it completes, the context is cancelled, or the deadline passes.
    /// The losing future is dropped, which aborts any request it had in flight.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            res = fut => res,
        }
    }

    /// Cancellable sleep used between retries.
    pub async fn sleep(&self, dur: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(dur).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let ctx = CallContext::background();
        let v = ctx.run(async { Ok(7) }).await.expect("ok");
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = CallContext::background();
        ctx.cancel();
        let res: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_aborts_pending_call() {
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let res: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(res, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn child_follows_parent_cancellation() {
        let parent = CallContext::background();
        let child = parent.child(Some(Duration::from_secs(60)));
        parent.cancel();
        assert!(child.is_cancelled());
        let res = child.sleep(Duration::from_secs(60)).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
