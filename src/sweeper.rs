//! Periodic background sweeps with cancellation support.
//!
//! Both the token cache and the rate limiter bound their memory with a
//! background pass that evicts stale entries. The loop shape is shared:
//!
//! ```text
//! loop {
//!     select! {
//!         cancelled  → break
//!         owner gone → break
//!         tick       → sweep
//!     }
//! }
//! ```
//!
//! The task only holds a [`Weak`] reference to its owner, so dropping the
//! owner also ends the sweep even when nobody cancelled it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Spawn a periodic sweep over `owner` on `tracker`.
///
/// `sweep` runs once per `every` until `cancel` fires or the last strong
/// reference to `owner` is dropped. The first immediate tick is skipped.
pub fn spawn_periodic<T, F>(
    name: &'static str,
    owner: &Arc<T>,
    every: Duration,
    cancel: CancellationToken,
    tracker: &TaskTracker,
    sweep: F,
) where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    let owner: Weak<T> = Arc::downgrade(owner);

    tracker.spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                biased; // Check cancellation first

                _ = cancel.cancelled() => {
                    debug!(task = name, "Sweep task received cancellation signal");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(owner) = owner.upgrade() else {
                        debug!(task = name, "Sweep owner dropped");
                        break;
                    };
                    trace!(task = name, "Running sweep");
                    sweep(&owner);
                }
            }
        }

        debug!(task = name, "Sweep task shutting down");
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sweep_runs_until_cancelled() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        spawn_periodic(
            "test",
            &counter,
            Duration::from_millis(10),
            cancel.clone(),
            &tracker,
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 1, "sweep should have run at least once");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs, "no runs after cancel");
    }

    #[tokio::test]
    async fn test_sweep_stops_when_owner_dropped() {
        let owner = Arc::new(AtomicUsize::new(0));
        let tracker = TaskTracker::new();

        spawn_periodic(
            "test",
            &owner,
            Duration::from_millis(10),
            CancellationToken::new(),
            &tracker,
            |_: &AtomicUsize| {},
        );

        drop(owner);
        tracker.close();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("task should exit once its owner is gone");
    }
}
