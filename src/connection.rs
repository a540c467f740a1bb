//! Redis connection pool with health checking
//!
//! A single multiplexed connection shared by all callers, with a semaphore
//! bounding the number of in-flight commands. Connection establishment is
//! retried with exponential backoff; individual commands run exactly once
//! and surface their failure to the caller, because replaying a queue
//! mutation blindly could apply it twice.
//!
//! # Example
//!
//! ```rust,no_run
//! use uniqueue::{RedisConfig, RedisPool};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::with_url("redis://localhost:6379")
//!     .pool_size(32)
//!     .command_timeout(Duration::from_secs(2));
//!
//! let pool = RedisPool::new(config).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::QueueError;
use crate::util::redacted_error;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Configuration for the Redis connection pool
///
/// Serde-derived so it can be embedded in a host application's config file;
/// missing fields fall back to the defaults below.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of concurrent in-flight commands
    /// Default: 16
    pub pool_size: u32,

    /// Timeout for establishing a connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Timeout for individual commands
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Backoff policy for connection establishment
    pub retry_policy: RetryPolicy,

    /// Health check interval
    /// Default: 30 seconds
    pub health_check_interval: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl RedisConfig {
    /// Create a new config with the specified URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of concurrent in-flight commands
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the connect backoff policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err("Redis URL must use the redis:// or rediss:// scheme".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("Pool size cannot exceed 1000".to_string());
        }
        Ok(())
    }
}

/// Exponential backoff policy for connection establishment
///
/// Commands are never retried through this policy; only (re)connect attempts
/// are.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    /// Default: 3
    pub max_retries: u32,

    /// Initial delay between attempts
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    /// Default: 5 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add random jitter to delays
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            delay_ms * (1.0 + jitter)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if another attempt is allowed after the given one
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Connection pool metrics
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total number of successful connections
    pub connections_created: AtomicU64,

    /// Total number of connection failures
    pub connection_failures: AtomicU64,

    /// Total number of commands executed
    pub commands_executed: AtomicU64,

    /// Total number of command failures
    pub command_failures: AtomicU64,

    /// Total number of reconnects after a dropped connection
    pub reconnects: AtomicU64,

    /// Total command latency in microseconds
    pub total_latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_connection(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Average command latency in microseconds
    pub fn average_latency_us(&self) -> f64 {
        let total = self.total_latency_us.load(Ordering::Relaxed);
        let count = self.commands_executed.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Get a snapshot of the metrics
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
        }
    }
}

/// Snapshot of pool metrics at a point in time
#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    /// Total number of connections created during pool lifetime
    pub connections_created: u64,
    /// Total number of connection failures during pool lifetime
    pub connection_failures: u64,
    /// Total number of commands executed through the pool
    pub commands_executed: u64,
    /// Total number of command failures encountered
    pub command_failures: u64,
    /// Total number of reconnects after a dropped connection
    pub reconnects: u64,
    /// Average command latency in microseconds
    pub average_latency_us: f64,
}

/// Health status of the Redis connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connection is healthy
    Healthy,
    /// Connection is degraded (slow but working)
    Degraded,
    /// Connection is unhealthy
    Unhealthy,
    /// Health status unknown (not yet checked)
    Unknown,
}

/// Redis connection pool
///
/// Shares one multiplexed connection across callers and reconnects lazily
/// after a transport failure.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// The multiplexed connection (Redis multiplexes internally)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Pool configuration
    config: RedisConfig,

    /// Connection metrics
    metrics: Arc<PoolMetrics>,

    /// Semaphore bounding concurrent in-flight commands
    semaphore: Arc<Semaphore>,

    /// Current health status
    health_status: RwLock<HealthStatus>,

    /// Last health check time
    last_health_check: RwLock<Option<Instant>>,
}

impl RedisPool {
    /// Create a new pool and establish the initial connection
    ///
    /// The initial connect is retried per the configured
    /// [`RetryPolicy`] before giving up.
    pub async fn new(config: RedisConfig) -> Result<Self, QueueError> {
        config.validate().map_err(QueueError::Connection)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| QueueError::Connection(redacted_error(&config.url, &e)))?;

        let semaphore = Arc::new(Semaphore::new(config.pool_size as usize));

        let pool = Self {
            client,
            connection: RwLock::new(None),
            metrics: Arc::new(PoolMetrics::default()),
            semaphore,
            health_status: RwLock::new(HealthStatus::Unknown),
            last_health_check: RwLock::new(None),
            config,
        };

        pool.connect_with_backoff().await?;

        debug!("Redis connection pool initialized");
        Ok(pool)
    }

    /// Establish or re-establish the connection (single attempt)
    async fn connect(&self) -> Result<(), QueueError> {
        let start = Instant::now();

        let conn_future = self.client.get_multiplexed_async_connection();
        let conn = tokio::time::timeout(self.config.connection_timeout, conn_future)
            .await
            .map_err(|_| {
                self.metrics.record_connection_failure();
                QueueError::Connection("connection timeout".to_string())
            })?
            .map_err(|e| {
                self.metrics.record_connection_failure();
                QueueError::Connection(redacted_error(&self.config.url, &e))
            })?;

        {
            let mut guard = self.connection.write().await;
            *guard = Some(conn);
        }

        self.metrics.record_connection();
        *self.health_status.write().await = HealthStatus::Healthy;

        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(())
    }

    /// Establish the connection, backing off per the retry policy
    async fn connect_with_backoff(&self) -> Result<(), QueueError> {
        let mut attempt = 0;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if self.config.retry_policy.should_retry(attempt) => {
                    let delay = self.config.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        "Redis connect failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Get a connection from the pool
    ///
    /// Acquires a semaphore permit and returns a guard; the permit is
    /// released when the guard is dropped.
    pub async fn get(&self) -> Result<PooledConnection, QueueError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Connection("pool closed".to_string()))?;

        let existing = {
            let guard = self.connection.read().await;
            guard.clone()
        };

        let conn = match existing {
            Some(c) => c,
            None => {
                // Connection was dropped earlier; re-establish it
                self.metrics.record_reconnect();
                self.connect().await?;
                let guard = self.connection.read().await;
                guard
                    .clone()
                    .ok_or_else(|| QueueError::Connection("no connection available".to_string()))?
            },
        };

        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Execute a single command attempt against the store
    ///
    /// The closure runs under the configured command timeout. Failures are
    /// not retried: a timed-out or failed mutation may or may not have been
    /// applied, and only the caller can decide whether replaying it is safe.
    /// Transport failures drop the stored connection so the next call
    /// reconnects.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let conn = self.get().await?;
        let start = Instant::now();

        let result = tokio::time::timeout(self.config.command_timeout, f(conn.conn.clone())).await;

        match result {
            Ok(Ok(value)) => {
                self.metrics.record_command(start.elapsed());
                Ok(value)
            },
            Ok(Err(e)) => {
                self.metrics.record_command_failure();
                if is_connection_error(&e) {
                    self.invalidate().await;
                }
                Err(QueueError::from_redis(&self.config.url, &e))
            },
            Err(_) => {
                self.metrics.record_command_failure();
                warn!(
                    "Redis command timed out after {:?}",
                    self.config.command_timeout
                );
                Err(QueueError::Connection(format!(
                    "command timed out after {:?}",
                    self.config.command_timeout
                )))
            },
        }
    }

    /// Drop the stored connection so the next caller reconnects
    async fn invalidate(&self) {
        *self.connection.write().await = None;
        *self.health_status.write().await = HealthStatus::Unhealthy;
    }

    /// Perform a health check
    ///
    /// Sends a PING and updates the stored health status.
    pub async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();

        let result = self
            .execute(
                |mut conn| async move { redis::cmd("PING").query_async::<String>(&mut conn).await },
            )
            .await;

        let status = match result {
            Ok(_) => {
                // Degraded if latency > 100ms
                if start.elapsed() > Duration::from_millis(100) {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            },
            Err(_) => HealthStatus::Unhealthy,
        };

        *self.health_status.write().await = status.clone();
        *self.last_health_check.write().await = Some(Instant::now());

        status
    }

    /// Get the current health status
    ///
    /// Uses try_read to stay non-blocking in sync contexts; returns Unknown
    /// if the lock is held.
    pub fn health_status(&self) -> HealthStatus {
        self.health_status
            .try_read()
            .map(|guard| guard.clone())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Check whether the health check interval has elapsed
    pub fn needs_health_check(&self) -> bool {
        match self.last_health_check.try_read() {
            Ok(guard) => match *guard {
                None => true,
                Some(instant) => instant.elapsed() > self.config.health_check_interval,
            },
            // Lock held: conservatively check
            Err(_) => true,
        }
    }

    /// Get a metrics snapshot
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get the pool configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// A pooled connection whose permit returns to the pool when dropped
pub struct PooledConnection {
    conn: MultiplexedConnection,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Get a mutable reference to the underlying connection
    pub fn connection(&mut self) -> &mut MultiplexedConnection {
        &mut self.conn
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Check if an error invalidates the stored connection
fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error() || e.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.command_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = RedisConfig {
            url: "".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "http://localhost:6379".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "redis://localhost".to_string(),
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "redis://localhost".to_string(),
            pool_size: 1001,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RedisConfig {
            url: "rediss://localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RedisConfig::with_url("redis://localhost:6380")
            .pool_size(32)
            .connection_timeout(Duration::from_secs(10))
            .command_timeout(Duration::from_secs(2));

        assert_eq!(config.url, "redis://localhost:6380");
        assert_eq!(config.pool_size, 32);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_config_roundtrips_through_serde() {
        let config = RedisConfig::with_url("redis://localhost:6380").pool_size(8);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RedisConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.url, config.url);
        assert_eq!(parsed.pool_size, 8);
        assert_eq!(parsed.command_timeout, config.command_timeout);
    }

    #[test]
    fn test_config_serde_defaults_missing_fields() {
        let parsed: RedisConfig =
            serde_json::from_str(r#"{"url": "redis://example:6379"}"#).unwrap();
        assert_eq!(parsed.url, "redis://example:6379");
        assert_eq!(parsed.pool_size, 16);
        assert_eq!(parsed.retry_policy.max_retries, 3);
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));

        // Caps at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::default();

        metrics.record_connection();
        metrics.record_command(Duration::from_micros(100));
        metrics.record_command(Duration::from_micros(200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.commands_executed, 2);
        assert_eq!(snapshot.average_latency_us, 150.0);
    }
}
