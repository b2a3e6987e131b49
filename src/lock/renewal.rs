//! Background lease renewal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::distributed::LockShared;
use crate::context::OpContext;

/// Observable state of a lock's auto-renew task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalStatus {
    /// Auto-renew is disabled or the lock has not been acquired yet.
    Idle,
    /// The task is alive and has renewed the lease `renewals` times.
    Running { renewals: u64 },
    /// The task was stopped by release or by a new acquisition.
    Stopped,
    /// A renewal failed and the task terminated.
    Failed(String),
}

/// Default interval when none was given: a third of the lease.
pub(super) fn effective_interval(configured: Duration, ttl: Duration) -> Duration {
    if configured.is_zero() {
        (ttl / 3).max(Duration::from_millis(1))
    } else {
        configured
    }
}

/// Spawn the renewal loop for a freshly acquired lock.
///
/// The first renewal happens one interval after acquisition. Any error ends
/// the loop; the reason is published on the lock's status channel.
pub(super) fn spawn(shared: Arc<LockShared>, interval: Duration) -> JoinHandle<()> {
    shared
        .status
        .send_replace(RenewalStatus::Running { renewals: 0 });
    debug!(key = %shared.key, interval_ms = interval.as_millis() as u64, "Starting auto-renew");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewals = 0u64;

        loop {
            ticker.tick().await;

            let ctx = OpContext::with_timeout(shared.renew_timeout);
            match shared.renew(&ctx, Duration::ZERO).await {
                Ok(()) => {
                    renewals += 1;
                    trace!(key = %shared.key, renewals, "Lease renewed");
                    shared
                        .status
                        .send_replace(RenewalStatus::Running { renewals });
                }
                Err(e) => {
                    warn!(key = %shared.key, error = %e, "Lease renewal failed, stopping auto-renew");
                    shared.status.send_replace(RenewalStatus::Failed(e.to_string()));
                    return;
                }
            }
        }
    })
}
