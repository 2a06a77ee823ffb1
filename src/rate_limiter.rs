//! Per-client fixed-window request counter.
//!
//! # Algorithm
//!
//! Each client key owns a window `{count, started_at}`:
//!
//! - No window yet, or the current one started more than `window` ago:
//!   open a fresh window with `count = 1` and admit.
//! - Otherwise increment `count` and admit while `count <= max_requests`.
//!
//! A request arriving after the window boundary always resets the counter,
//! regardless of how many requests the previous window denied.
//!
//! The whole check-and-update runs under one mutex, so concurrent requests
//! for the same key never lose an increment.
//!
//! # Memory
//!
//! Windows of clients that stopped sending are removed by a periodic sweep
//! (see [`RateLimiter::spawn_sweeper`]).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::metrics;
use crate::sweeper::spawn_periodic;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    started_at: Instant,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied until the current window ends, `retry_after` from now.
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Concurrent fixed-window rate limiter keyed by client identifier.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
    max_requests: NonZeroU32,
    window: Duration,
    shutdown: CancellationToken,
}

impl RateLimiter {
    /// Allow at most `max_requests` per `window` for each client key.
    pub fn new(max_requests: NonZeroU32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests.get()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, window: &RateWindow, now: Instant) -> bool {
        now.saturating_duration_since(window.started_at) > self.window
    }

    /// Count one request for `client_key` and report whether it is admitted.
    pub fn allow(&self, client_key: &str) -> bool {
        self.check(client_key).is_allowed()
    }

    /// Like [`allow`](Self::allow), also reporting when a denied client may retry.
    pub fn check(&self, client_key: &str) -> RateDecision {
        let now = Instant::now();
        let mut windows = self.lock();

        let fresh = RateWindow {
            count: 1,
            started_at: now,
        };

        let Some(w) = windows.get_mut(client_key) else {
            windows.insert(client_key.to_string(), fresh);
            return RateDecision::Allowed;
        };

        if self.is_expired(w, now) {
            *w = fresh;
            return RateDecision::Allowed;
        }

        w.count = w.count.saturating_add(1);
        if w.count <= self.max_requests.get() {
            RateDecision::Allowed
        } else {
            let elapsed = now.saturating_duration_since(w.started_at);
            RateDecision::Limited {
                retry_after: self.window.saturating_sub(elapsed),
            }
        }
    }

    /// Remove every expired window, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();

        let before = windows.len();
        windows.retain(|_, w| !self.is_expired(w, now));
        let removed = before - windows.len();

        metrics::set_rate_limiter_clients(windows.len());
        if removed > 0 {
            debug!(removed, remaining = windows.len(), "Rate limiter sweep");
        }
        removed
    }

    /// Number of tracked client windows, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweep on `tracker`. It runs until [`stop`](Self::stop).
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, tracker: &TaskTracker) {
        spawn_periodic(
            "rate_limiter_sweep",
            self,
            every,
            self.shutdown.clone(),
            tracker,
            |limiter: &Self| {
                limiter.sweep();
            },
        );
    }

    /// Stop the background sweep. Safe to call more than once.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limiter(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(NonZeroU32::new(max).unwrap(), window)
    }

    #[test]
    fn test_two_per_minute() {
        let rl = limiter(2, Duration::from_secs(60));

        assert!(rl.allow("ip1"));
        assert!(rl.allow("ip1"));
        assert!(!rl.allow("ip1"));
    }

    #[test]
    fn test_exactly_max_admitted() {
        let rl = limiter(5, Duration::from_secs(60));

        for i in 0..5 {
            assert!(rl.allow("c"), "request {i} should be admitted");
        }
        assert!(!rl.allow("c"));
        assert!(!rl.allow("c"));
    }

    #[test]
    fn test_clients_are_independent() {
        let rl = limiter(1, Duration::from_secs(60));

        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[test]
    fn test_window_reset_after_denials() {
        let rl = limiter(1, Duration::from_millis(30));

        assert!(rl.allow("c"));
        assert!(!rl.allow("c"));
        assert!(!rl.allow("c"));
        std::thread::sleep(Duration::from_millis(50));

        assert!(rl.allow("c"), "new window admits again");
        assert!(!rl.allow("c"));
    }

    #[test]
    fn test_limited_reports_remaining_window() {
        let rl = limiter(1, Duration::from_secs(60));

        assert_eq!(rl.check("c"), RateDecision::Allowed);
        match rl.check("c") {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(55));
            }
            RateDecision::Allowed => panic!("second request should be limited"),
        }
    }

    #[test]
    fn test_sweep_removes_stale_windows() {
        let rl = limiter(10, Duration::from_millis(30));
        rl.allow("old");
        std::thread::sleep(Duration::from_millis(50));
        rl.allow("fresh");

        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.len(), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_and_stop() {
        let rl = Arc::new(limiter(10, Duration::from_millis(20)));
        let tracker = TaskTracker::new();
        rl.spawn_sweeper(Duration::from_millis(10), &tracker);

        rl.allow("c");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rl.is_empty());

        rl.stop();
        rl.stop();
        tracker.close();
        tracker.wait().await;

        assert!(rl.allow("c"), "limiter keeps working after stop");
    }

    #[tokio::test]
    async fn test_no_lost_updates_under_concurrency() {
        let rl = Arc::new(limiter(100, Duration::from_secs(60)));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                (0..20).filter(|_| rl.allow("shared")).count()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, 100);
    }
}
