//! Configuration types for sentinelq.
//!
//! This module contains all configuration structures used throughout sentinelq:
//! backend connection settings, circuit breaker thresholds, task processor sizing,
//! degradation/recovery timing, fallback cache limits and logging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SentinelError, SentinelResult};

/// Main configuration for sentinelq.
///
/// # Examples
///
/// ```rust
/// use sentinelq::config::{ProcessorConfig, SentinelConfig};
///
/// // Use default configuration
/// let config = SentinelConfig::default();
///
/// // Custom configuration
/// let config = SentinelConfig {
///     processor: ProcessorConfig {
///         worker_count: 8,
///         max_queue_size: 5000,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Cache/queue backend connection
    pub backend: BackendConfig,

    /// Circuit breaker guarding the backend
    pub circuit_breaker: CircuitBreakerConfig,

    /// Background task processor
    pub processor: ProcessorConfig,

    /// Graceful degradation coordinator
    pub degradation: DegradationConfig,

    /// In-process fallback cache and rate limiter
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Backend connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Primary connection string (e.g., "redis://localhost:6379")
    pub url: String,

    /// Read replicas tried in order when the primary fails
    pub replica_urls: Vec<String>,

    /// Key prefix for every key this crate writes
    pub key_prefix: String,

    /// Deadline for establishing a connection (in milliseconds)
    pub connection_timeout_ms: u64,

    /// Deadline for a single command (in milliseconds)
    pub command_timeout_ms: u64,

    /// Deadline for the fast ping used on replicas (in milliseconds)
    pub replica_ping_timeout_ms: u64,

    /// How long a successful health check is trusted (in milliseconds)
    pub health_cache_ttl_ms: u64,

    /// Background ping interval (in seconds)
    pub health_check_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            replica_urls: Vec::new(),
            key_prefix: "sentinelq".to_string(),
            connection_timeout_ms: 5000,
            command_timeout_ms: 2000,
            replica_ping_timeout_ms: 500,
            health_cache_ttl_ms: 30_000,
            health_check_interval_secs: 30,
        }
    }
}

impl BackendConfig {
    /// Create a backend configuration for the given URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Add a read replica.
    pub fn with_replica(mut self, url: impl Into<String>) -> Self {
        self.replica_urls.push(url.into());
        self
    }

    /// Set the per-command timeout.
    pub fn with_command_timeout(mut self, timeout_ms: u64) -> Self {
        self.command_timeout_ms = timeout_ms;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call (in milliseconds)
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Open timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        self.timeout_ms.millis()
    }
}

/// Background task processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Queue depth (all tiers) at which `queue_task` rejects new work
    pub max_queue_size: usize,

    /// Number of worker loops
    pub worker_count: usize,

    /// Default per-attempt deadline (in milliseconds)
    pub processing_timeout_ms: u64,

    /// Default `max_attempts` for tasks built by the processor
    pub retry_attempts: u32,

    /// Base of the exponential retry delay, in seconds
    pub retry_backoff: f64,

    /// Upper bound of the retry delay (in seconds)
    pub max_retry_delay_secs: u64,

    /// Informational; dead-lettering is governed by each task's `max_attempts`
    pub dead_letter_threshold: u32,

    /// Sleep between empty polls (in milliseconds)
    pub poll_interval_ms: u64,

    /// Worker/queue health log interval (in seconds)
    pub health_check_interval_secs: u64,

    /// Backpressure evaluation interval (in seconds)
    pub metrics_interval_secs: u64,

    /// TTL of status and result records (in seconds)
    pub status_ttl_secs: u64,

    /// Time to wait for workers to drain on stop (in seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            worker_count: 3,
            processing_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_backoff: 2.0,
            max_retry_delay_secs: 300, // 5 minutes
            dead_letter_threshold: 5,
            poll_interval_ms: 1000,
            health_check_interval_secs: 30,
            metrics_interval_secs: 60,
            status_ttl_secs: 3600, // 1 hour
            shutdown_timeout_secs: 30,
        }
    }
}

impl ProcessorConfig {
    /// Create a processor configuration with a specific number of workers.
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// Set the maximum queue size.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, attempts: u32, backoff: f64) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Default per-attempt deadline
    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout_ms.millis()
    }

    /// Delay before the retry that follows the `attempts`-th failure:
    /// `retry_backoff ^ attempts` seconds, capped at `max_retry_delay_secs`
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let cap = self.max_retry_delay_secs.secs();
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.retry_backoff.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
    }
}

/// Degradation coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Service health poll interval (in seconds)
    pub health_check_interval_secs: u64,

    /// Recovery loop interval (in seconds)
    pub recovery_check_interval_secs: u64,

    /// Base of the recovery backoff, in seconds
    pub backoff_base: f64,

    /// Cap for the recovery backoff (in seconds)
    pub max_backoff_delay_secs: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            recovery_check_interval_secs: 60,
            backoff_base: 2.0,
            max_backoff_delay_secs: 300, // 5 minutes
        }
    }
}

impl DegradationConfig {
    /// Backoff before the next recovery attempt
    pub fn recovery_delay(&self, recovery_attempts: u32) -> Duration {
        let cap = self.max_backoff_delay_secs as f64;
        let secs = self.backoff_base.powi(recovery_attempts as i32).min(cap);
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff_delay_secs.secs())
    }
}

/// Fallback cache and rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held by the memory cache
    pub max_size: usize,

    /// TTL used when callers do not pass one (in seconds)
    pub default_ttl_secs: u64,

    /// Identifiers idle for longer than this are dropped by the limiter (in seconds)
    pub limiter_idle_secs: u64,

    /// Minimum time between limiter cleanup sweeps (in seconds)
    pub limiter_cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_secs: 300,
            limiter_idle_secs: 3600,
            limiter_cleanup_interval_secs: 300,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber for this configuration.
    ///
    /// Returns `false` when a subscriber was already installed.
    pub fn init_tracing(&self) -> bool {
        let level: tracing::Level = self.level.clone().into();
        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(self.include_targets);

        if self.json_format {
            builder.json().try_init().is_ok()
        } else {
            builder.with_ansi(self.colored).try_init().is_ok()
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(SentinelError::config(format!("unknown log level '{other}'"))),
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

impl SentinelConfig {
    /// Parse a configuration document; missing fields take their defaults.
    pub fn from_json_str(data: &str) -> SentinelResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> SentinelResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> SentinelResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.backend.url = url;
        }
        if let Some(replicas) = lookup("REDIS_REPLICA_URLS") {
            self.backend.replica_urls = replicas
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(workers) = lookup("TASK_WORKER_COUNT") {
            self.processor.worker_count = workers.parse().map_err(|_| {
                SentinelError::config(format!("TASK_WORKER_COUNT is not a number: '{workers}'"))
            })?;
        }
        if let Some(size) = lookup("TASK_MAX_QUEUE_SIZE") {
            self.processor.max_queue_size = size.parse().map_err(|_| {
                SentinelError::config(format!("TASK_MAX_QUEUE_SIZE is not a number: '{size}'"))
            })?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.parse()?;
        }
        Ok(())
    }

    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            processor: ProcessorConfig {
                worker_count: 2,
                max_queue_size: 100,
                health_check_interval_secs: 10,
                metrics_interval_secs: 15,
                ..Default::default()
            },
            degradation: DegradationConfig {
                health_check_interval_secs: 10,
                recovery_check_interval_secs: 15,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            processor: ProcessorConfig {
                worker_count: (num_cpus::get() * 2).max(2),
                max_queue_size: 10_000,
                retry_attempts: 5,
                ..Default::default()
            },
            cache: CacheConfig {
                max_size: 10_000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            backend: BackendConfig {
                url: "memory://test".to_string(),
                connection_timeout_ms: 500,
                command_timeout_ms: 500,
                replica_ping_timeout_ms: 100,
                health_cache_ttl_ms: 0,
                health_check_interval_secs: 1,
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                timeout_ms: 200,
            },
            processor: ProcessorConfig {
                worker_count: 1,
                max_queue_size: 100,
                processing_timeout_ms: 2000,
                retry_backoff: 0.05,
                poll_interval_ms: 20,
                health_check_interval_secs: 1,
                metrics_interval_secs: 1,
                shutdown_timeout_secs: 5,
                ..Default::default()
            },
            degradation: DegradationConfig {
                health_check_interval_secs: 1,
                recovery_check_interval_secs: 1,
                backoff_base: 1.0,
                max_backoff_delay_secs: 1,
            },
            cache: CacheConfig {
                max_size: 100,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.backend.url.trim().is_empty() {
            errors.push("Backend URL must not be empty".to_string());
        }

        if self.backend.command_timeout_ms == 0 {
            errors.push("Backend command timeout must be greater than 0".to_string());
        }

        if self.backend.connection_timeout_ms == 0 {
            errors.push("Backend connection timeout must be greater than 0".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("Circuit breaker failure threshold must be greater than 0".to_string());
        }

        if self.processor.worker_count == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.processor.worker_count > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        if self.processor.max_queue_size == 0 {
            errors.push("Maximum queue size must be greater than 0".to_string());
        }

        if self.processor.processing_timeout_ms == 0 {
            errors.push("Processing timeout must be greater than 0".to_string());
        }

        if !(self.processor.retry_backoff.is_finite() && self.processor.retry_backoff > 0.0) {
            errors.push("Retry backoff must be a positive number".to_string());
        }

        if self.processor.poll_interval_ms == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }

        if self.degradation.recovery_check_interval_secs == 0
            || self.degradation.health_check_interval_secs == 0
        {
            errors.push("Degradation check intervals must be greater than 0".to_string());
        }

        if self.cache.max_size == 0 {
            errors.push("Fallback cache size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
