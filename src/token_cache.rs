//! TTL cache of recently verified bearer tokens.
//!
//! Verifying a token means a round trip to the identity provider. A token
//! that verified successfully is remembered for a fixed TTL so that repeat
//! requests from the same session skip the provider entirely.
//!
//! # Expiry
//!
//! Entries expire in two steps:
//!
//! - **Logically** on read: [`TokenVerificationCache::get`] never returns an
//!   entry whose deadline has passed, whether or not a sweep ran.
//! - **Physically** on sweep: a background task started with
//!   [`TokenVerificationCache::spawn_sweeper`] removes expired entries.
//!
//! Stopping the sweep only affects memory reclamation, never correctness.
//!
//! # Negative results
//!
//! Only successful verifications are stored. A rejected or failed
//! verification is never cached, so the next request with the same token
//! goes back to the provider.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::identity::UserId;
use crate::metrics;
use crate::sweeper::spawn_periodic;

/// Default time a verified token stays cached.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry {
    user_id: UserId,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Concurrent map from bearer token to the principal it verified as.
///
/// Lookups take the read lock, inserts and sweeps take the write lock.
pub struct TokenVerificationCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    shutdown: CancellationToken,
}

impl TokenVerificationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a token; `None` if absent or expired.
    pub fn get(&self, token: &str) -> Option<UserId> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(token)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.user_id.clone())
    }

    /// Insert or overwrite a token, expiring `ttl` from now.
    pub fn set(&self, token: impl Into<String>, user_id: UserId) {
        let entry = CacheEntry {
            user_id,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), entry);
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();

        metrics::set_token_cache_entries(entries.len());
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Token cache sweep");
        }
        removed
    }

    /// Number of physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweep on `tracker`. It runs until [`stop`](Self::stop).
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, tracker: &TaskTracker) {
        spawn_periodic(
            "token_cache_sweep",
            self,
            every,
            self.shutdown.clone(),
            tracker,
            |cache: &Self| {
                cache.sweep();
            },
        );
    }

    /// Stop the background sweep. Safe to call more than once.
    ///
    /// `get` and `set` keep working afterwards; expired entries are simply
    /// no longer reclaimed.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Default for TokenVerificationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_token() {
        let cache = TokenVerificationCache::default();
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn test_set_then_get() {
        let cache = TokenVerificationCache::default();
        cache.set("tok", UserId::new("u1"));

        assert_eq!(cache.get("tok"), Some(UserId::new("u1")));
    }

    #[test]
    fn test_set_overwrites_and_refreshes() {
        let cache = TokenVerificationCache::default();
        cache.set("tok", UserId::new("u1"));
        cache.set("tok", UserId::new("u2"));

        assert_eq!(cache.get("tok"), Some(UserId::new("u2")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_hidden_before_sweep() {
        let cache = TokenVerificationCache::new(Duration::from_millis(20));
        cache.set("tok", UserId::new("u1"));
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("tok"), None);
        // Still physically present until a sweep runs
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = TokenVerificationCache::new(Duration::from_millis(30));
        cache.set("old", UserId::new("u1"));
        std::thread::sleep(Duration::from_millis(50));
        cache.set("fresh", UserId::new("u2"));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(UserId::new("u2")));
    }

    #[test]
    fn test_zero_ttl_never_returns() {
        let cache = TokenVerificationCache::new(Duration::ZERO);
        cache.set("tok", UserId::new("u1"));
        assert_eq!(cache.get("tok"), None);
    }

    #[test]
    fn test_tokens_are_independent() {
        let cache = TokenVerificationCache::default();
        cache.set("a", UserId::new("ua"));
        cache.set("b", UserId::new("ub"));

        assert_eq!(cache.get("a"), Some(UserId::new("ua")));
        assert_eq!(cache.get("b"), Some(UserId::new("ub")));
    }

    #[tokio::test]
    async fn test_background_sweep_reclaims_storage() {
        let cache = Arc::new(TokenVerificationCache::new(Duration::from_millis(20)));
        let tracker = TaskTracker::new();
        cache.spawn_sweeper(Duration::from_millis(10), &tracker);

        cache.set("tok", UserId::new("u1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.is_empty(), "sweep should have removed the expired entry");

        cache.stop();
        cache.stop(); // idempotent
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_cache_usable_after_stop() {
        let cache = Arc::new(TokenVerificationCache::default());
        let tracker = TaskTracker::new();
        cache.spawn_sweeper(Duration::from_millis(10), &tracker);

        cache.stop();
        tracker.close();
        tracker.wait().await;

        cache.set("tok", UserId::new("u1"));
        assert_eq!(cache.get("tok"), Some(UserId::new("u1")));
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let cache = Arc::new(TokenVerificationCache::default());
        let mut handles = Vec::new();

        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let token = format!("tok-{}", i % 4);
                for _ in 0..100 {
                    cache.set(token.clone(), UserId::new(token.clone()));
                    let seen = cache.get(&token).unwrap();
                    assert_eq!(seen.as_str(), token);
                    cache.sweep();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.len(), 4);
    }
}
