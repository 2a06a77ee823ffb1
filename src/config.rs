//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Authentication
//!
//! - `IDENTITY_VERIFY_URL`: userinfo endpoint that accepts the bearer token
//! - `TOKEN_CACHE_TTL_SECS`: how long a verified token is trusted (default: 300)
//! - `AUTH_BYPASS_PATHS`: comma-separated paths served without a token (default: `/health`)
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_MAX_REQUESTS`: requests per window per client (default: 100, 0 = disabled)
//! - `RATE_LIMIT_WINDOW_SECS`: fixed window length (default: 60)
//! - `TRUSTED_PROXIES`: networks allowed to set `X-Forwarded-For` / `X-Real-IP`

use std::env;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::identity::CircuitBreakerConfig;

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Identity Provider Configuration
    // =========================================================================
    /// Endpoint that resolves a bearer token to its subject
    pub identity_verify_url: String,

    /// Deadline for a single verification call (default: 5 seconds)
    pub identity_verify_timeout: Duration,

    /// Lifetime of a cached verification (default: 5 minutes)
    pub token_cache_ttl: Duration,

    /// Interval between token cache sweeps (default: 60 seconds)
    pub token_cache_sweep_interval: Duration,

    /// Paths that bypass authentication. Exact match.
    /// Default: ["/health"]
    pub auth_bypass_paths: Vec<String>,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Number of consecutive provider failures before opening the circuit (default: 5)
    pub circuit_breaker_failure_threshold: u32,

    /// Number of consecutive successes in half-open state to close circuit (default: 2)
    pub circuit_breaker_success_threshold: u32,

    /// How long the circuit stays open before transitioning to half-open (default: 30s)
    pub circuit_breaker_open_duration: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests admitted per client per window (default: 100)
    /// Set to 0 to disable rate limiting
    pub rate_limit_max_requests: u32,

    /// Fixed window length (default: 60 seconds)
    pub rate_limit_window: Duration,

    /// Interval between rate limiter sweeps (default: 60 seconds)
    pub rate_limit_sweep_interval: Duration,

    /// Trusted proxy networks for client identification.
    /// Proxy headers are only honored when the TCP peer is inside one of them.
    ///
    /// Format: Comma-separated IPs or CIDRs (e.g., "10.0.0.0/8,127.0.0.1")
    /// Default: Empty (trust all sources)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a value does not parse or fails validation.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Identity provider
            identity_verify_url: env::var("IDENTITY_VERIFY_URL")
                .unwrap_or_else(|_| "http://localhost:9099/userinfo".to_string()),
            identity_verify_timeout: Duration::from_millis(Self::parse_env(
                "IDENTITY_VERIFY_TIMEOUT_MS",
                5000,
            )?),
            token_cache_ttl: Duration::from_secs(Self::parse_env("TOKEN_CACHE_TTL_SECS", 300)?),
            token_cache_sweep_interval: Duration::from_secs(Self::parse_env(
                "TOKEN_CACHE_SWEEP_SECS",
                60,
            )?),
            auth_bypass_paths: Self::parse_auth_bypass_paths(),

            // Circuit breaker
            circuit_breaker_failure_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            circuit_breaker_success_threshold: Self::parse_env(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD",
                2,
            )?,
            circuit_breaker_open_duration: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                30,
            )?),

            // Rate limiting
            rate_limit_max_requests: Self::parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_SECS",
                60,
            )?),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        let durations = [
            ("IDENTITY_VERIFY_TIMEOUT_MS", self.identity_verify_timeout),
            ("TOKEN_CACHE_TTL_SECS", self.token_cache_ttl),
            ("TOKEN_CACHE_SWEEP_SECS", self.token_cache_sweep_interval),
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window),
            ("RATE_LIMIT_SWEEP_SECS", self.rate_limit_sweep_interval),
            (
                "CIRCUIT_BREAKER_OPEN_DURATION_SECS",
                self.circuit_breaker_open_duration,
            ),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(AppError::Config(format!("{name} must be greater than 0")));
        }

        if self.circuit_breaker_failure_threshold == 0 {
            return Err(AppError::Config(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker_success_threshold == 0 {
            return Err(AppError::Config(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        let url = self.identity_verify_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "IDENTITY_VERIFY_URL must be an http(s) URL, got '{url}'"
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_max_requests > 0
    }

    /// Per-window quota, `None` when rate limiting is disabled.
    pub fn rate_limit_quota(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.rate_limit_max_requests)
    }

    /// Circuit breaker settings for the identity provider.
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.circuit_breaker_failure_threshold,
            self.circuit_breaker_success_threshold,
            self.circuit_breaker_open_duration,
        )
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list, dropping blank entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }

    /// Parse auth bypass paths from environment variable.
    ///
    /// Entries that do not start with `/` can never match a request path and
    /// are dropped.
    fn parse_auth_bypass_paths() -> Vec<String> {
        Self::parse_list("AUTH_BYPASS_PATHS", "/health")
            .into_iter()
            .filter(|s| s.starts_with('/'))
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_request_body_size: 1024 * 1024,
            // Identity provider
            identity_verify_url: "http://localhost:9099/userinfo".to_string(),
            identity_verify_timeout: Duration::from_secs(5),
            token_cache_ttl: Duration::from_secs(5 * 60),
            token_cache_sweep_interval: Duration::from_secs(60),
            auth_bypass_paths: vec!["/health".to_string()],
            // Circuit breaker
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_success_threshold: 2,
            circuit_breaker_open_duration: Duration::from_secs(30),
            // Rate limiting
            rate_limit_max_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_sweep_interval: Duration::from_secs(60),
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}
