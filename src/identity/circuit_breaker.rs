//! Circuit breaker around the identity provider.
//!
//! Failed verifications are never cached, so during a provider outage every
//! request would otherwise go back to the provider. The breaker caps that
//! amplification by failing fast once the provider is known to be down.
//!
//! # States
//!
//! ```text
//!            provider failures ≥ threshold
//!   Closed ─────────────────────────────────► Open (fail fast)
//!     ▲                                         │
//!     │ successes ≥ threshold                   │ open_duration elapsed
//!     │                                         ▼
//!     └──────────────────────────────────── HalfOpen (single probe)
//!                                               │
//!                         probe fails ──────────┘ (back to Open)
//! ```
//!
//! Only [`VerifyError::is_provider_failure`] outcomes count as failures. A
//! rejected token is a healthy provider answering "no".

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{IdentityVerifier, UserId, VerifyError};
use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all calls pass through.
    Closed,
    /// Failing fast - calls are rejected without reaching the provider.
    Open,
    /// Testing recovery - one probe call at a time is admitted.
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive provider failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing the circuit.
    pub success_threshold: u32,
    /// How long to fail fast before admitting a probe.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_duration,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    // Set while a half-open probe is outstanding. A probe whose request was
    // cancelled never reports back, so a stale probe is replaced.
    probe_started_at: Option<Instant>,
}

/// Thread-safe circuit breaker.
///
/// All transitions happen under one mutex; the critical sections never await.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    times_opened: AtomicU32,
    calls_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
                probe_started_at: None,
            }),
            times_opened: AtomicU32::new(0),
            calls_rejected: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may reach the provider.
    pub fn allow_call(&self) -> bool {
        let mut s = self.lock();

        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let expired = s
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_duration);
                if expired {
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    s.probe_started_at = Some(Instant::now());
                    metrics::set_verifier_circuit_state(CircuitState::HalfOpen.gauge_value());
                    info!("Identity provider circuit half-open, admitting probe");
                    true
                } else {
                    self.calls_rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            CircuitState::HalfOpen => {
                let probe_pending = s
                    .probe_started_at
                    .is_some_and(|at| at.elapsed() < self.config.open_duration);
                if probe_pending {
                    self.calls_rejected.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    s.probe_started_at = Some(Instant::now());
                    true
                }
            }
        }
    }

    /// Record a call that reached a healthy provider.
    pub fn record_success(&self) {
        let mut s = self.lock();

        match s.state {
            CircuitState::Closed => s.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                s.probe_started_at = None;
                s.consecutive_successes += 1;
                debug!(
                    consecutive_successes = s.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Identity provider probe succeeded"
                );
                if s.consecutive_successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.opened_at = None;
                    s.consecutive_failures = 0;
                    metrics::set_verifier_circuit_state(CircuitState::Closed.gauge_value());
                    info!("Identity provider circuit closed after recovery");
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
    }

    /// Record a provider-side failure.
    pub fn record_failure(&self) {
        let mut s = self.lock();

        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut s);
                    warn!(
                        failures = s.consecutive_failures,
                        open_duration = ?self.config.open_duration,
                        "Identity provider circuit opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut s);
                warn!("Identity provider circuit reopened after failed probe");
            }
            CircuitState::Open => s.opened_at = Some(Instant::now()),
        }
    }

    fn open(&self, s: &mut BreakerState) {
        s.state = CircuitState::Open;
        s.opened_at = Some(Instant::now());
        s.consecutive_successes = 0;
        s.probe_started_at = None;
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        metrics::set_verifier_circuit_state(CircuitState::Open.gauge_value());
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    pub fn calls_rejected(&self) -> u64 {
        self.calls_rejected.load(Ordering::Relaxed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Verifier decorator adding a per-call deadline and a circuit breaker.
pub struct GuardedVerifier<V> {
    inner: V,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl<V: IdentityVerifier> GuardedVerifier<V> {
    pub fn new(inner: V, breaker: CircuitBreakerConfig, timeout: Duration) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(breaker),
            timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl<V: IdentityVerifier> IdentityVerifier for GuardedVerifier<V> {
    async fn verify(&self, token: &str) -> Result<UserId, VerifyError> {
        if !self.breaker.allow_call() {
            return Err(VerifyError::CircuitOpen);
        }

        let result = match tokio::time::timeout(self.timeout, self.inner.verify(token)).await {
            Ok(result) => result,
            Err(_) => Err(VerifyError::Timeout),
        };

        match &result {
            Err(e) if e.is_provider_failure() => self.breaker.record_failure(),
            _ => self.breaker.record_success(),
        }

        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Verifier that replays a fixed outcome and counts calls.
    struct Scripted {
        outcome: Result<UserId, VerifyError>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IdentityVerifier for Scripted {
        async fn verify(&self, _token: &str) -> Result<UserId, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone()
        }
    }

    fn scripted(outcome: Result<UserId, VerifyError>) -> (Scripted, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Scripted {
                outcome,
                delay: Duration::ZERO,
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[test]
    fn test_breaker_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_call());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(3, 1, Duration::from_secs(30)));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 1);
        assert!(!cb.allow_call());
        assert_eq!(cb.calls_rejected(), 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)));

        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, 1, Duration::from_millis(20)));

        cb.record_failure();
        assert!(!cb.allow_call());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_call(), "open duration elapsed, probe admitted");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow_call(), "second call waits for the probe");

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new(1, 1, Duration::ZERO));

        cb.record_failure();
        assert!(cb.allow_call());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);
    }

    #[tokio::test]
    async fn test_guarded_rejection_does_not_trip() {
        let (inner, calls) = scripted(Err(VerifyError::Rejected));
        let guarded = GuardedVerifier::new(
            inner,
            CircuitBreakerConfig::new(1, 1, Duration::from_secs(30)),
            Duration::from_secs(1),
        );

        for _ in 0..3 {
            assert_eq!(guarded.verify("bad").await, Err(VerifyError::Rejected));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guarded.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_guarded_fails_fast_when_open() {
        let (inner, calls) = scripted(Err(VerifyError::Unavailable("down".into())));
        let guarded = GuardedVerifier::new(
            inner,
            CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)),
            Duration::from_secs(1),
        );

        guarded.verify("t").await.unwrap_err();
        guarded.verify("t").await.unwrap_err();
        assert_eq!(guarded.breaker().state(), CircuitState::Open);

        assert_eq!(guarded.verify("t").await, Err(VerifyError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "provider not called while open");
    }

    #[tokio::test]
    async fn test_guarded_enforces_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = Scripted {
            outcome: Ok(UserId::new("u1")),
            delay: Duration::from_secs(5),
            calls: calls.clone(),
        };
        let guarded = GuardedVerifier::new(
            slow,
            CircuitBreakerConfig::default(),
            Duration::from_millis(20),
        );

        assert_eq!(guarded.verify("t").await, Err(VerifyError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
