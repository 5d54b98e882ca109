//! Per-call cancellation and deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::MetaStoreError;

/// Cancellation signal and optional deadline passed to every backend call.
///
/// Backends check the context before entering a mutation's critical section
/// and while waiting on locks or I/O that has no side effects yet. Once the
/// critical section is entered the mutation runs to completion, so a canceled
/// call never leaves a partial write behind.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a context canceled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child context that is canceled with this one but can also be
    /// canceled on its own. The tighter of the two deadlines applies.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout) {
            (Some(parent), Some(t)) => Some(parent.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (parent, None) => parent,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the call was canceled or its deadline has passed.
    pub fn check(&self) -> Result<(), MetaStoreError> {
        if self.token.is_cancelled() {
            return Err(MetaStoreError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(MetaStoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` until it completes, the context is canceled, or the
    /// deadline passes. Only wrap work whose abandonment has no side effects.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, MetaStoreError>
    where
        F: Future,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(MetaStoreError::Canceled),
            _ = deadline => Err(MetaStoreError::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}
