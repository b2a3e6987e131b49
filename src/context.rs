//! Cancellation and deadline propagation for store round trips.
//!
//! Every operation that talks to the store or sleeps between retries takes an
//! [`OpContext`]. Cancellation and deadline expiry surface as distinct errors
//! so callers can tell "gave up due to timeout" from "resource exhausted".

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LatchkeyError, Result};
use crate::store::StoreResult;

/// Cancellation token plus optional deadline, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A fresh context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().with_deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// A child context, cancelled together with this one but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and all its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Race `fut` against cancellation and the deadline.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LatchkeyError::Cancelled),
            _ = deadline => Err(LatchkeyError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Run a store call, tagging failures with the operation and key.
    pub(crate) async fn call<T, F>(&self, op: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.run(fut)
            .await?
            .map_err(|e| LatchkeyError::store(op, key, e))
    }
}
