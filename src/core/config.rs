//! Construction-time configuration for the streaming core
//!
//! Every field has a fixed default from [`crate::core::constants`] and can
//! be overridden by an environment variable, following the same
//! read-env-then-fall-back-to-constant pattern the teacher stack uses for
//! its own topic and database configuration.

use std::env;
use std::time::Duration;

use super::constants::*;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Configuration for the [`crate::pool::ListenerPool`] and the
/// [`crate::listener::NotificationListener`]s it owns.
#[derive(Debug, Clone)]
pub struct ListenerPoolConfig {
    /// Number of notification listeners in the pool
    pub pool_size: usize,
    /// Capacity cap per listener before hash routing falls back to
    /// least-loaded selection
    pub max_streams_per_listener: usize,
    /// Interval between health-check pings on each listening connection
    pub health_check_interval: Duration,
    /// Delay between reconnect attempts after the listening connection is
    /// lost
    pub retry_timeout: Duration,
    /// Reconnect attempts tolerated before the failure is propagated to
    /// every stream owned by the listener
    pub retry_limit: u32,
    /// Max rows read from the store per reader round-trip
    pub query_batch_size: i64,
    /// Backoff between reader retries after a query error
    pub reader_backoff: Duration,
    /// Consecutive query failures tolerated before the reader propagates
    /// the error and terminates the stream
    pub max_reader_retries: u32,
}

impl Default for ListenerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: env_or(ENV_POOL_SIZE, POOL_SIZE),
            max_streams_per_listener: env_or(
                ENV_MAX_STREAMS_PER_LISTENER,
                MAX_STREAMS_PER_LISTENER,
            ),
            health_check_interval: Duration::from_millis(env_or(
                ENV_HEALTH_CHECK_INTERVAL_MS,
                HEALTH_CHECK_INTERVAL_MS,
            )),
            retry_timeout: Duration::from_millis(env_or(ENV_RETRY_TIMEOUT_MS, RETRY_TIMEOUT_MS)),
            retry_limit: env_or(ENV_RETRY_LIMIT, RETRY_LIMIT),
            query_batch_size: env_or(ENV_QUERY_BATCH_SIZE, QUERY_BATCH_SIZE),
            reader_backoff: Duration::from_millis(env_or(
                ENV_READER_BACKOFF_MS,
                READER_BACKOFF_MS,
            )),
            max_reader_retries: env_or(ENV_MAX_READER_RETRIES, MAX_READER_RETRIES),
        }
    }
}

/// Default batching parameters applied when a subscriber requests batching
/// (`max_size` or `timeout_ms`) without giving explicit values.
#[derive(Debug, Clone, Copy)]
pub struct BatchDefaults {
    pub max_size: usize,
    pub timeout: Duration,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            max_size: env_or(ENV_BATCH_MAX_SIZE, DEFAULT_BATCH_MAX_SIZE),
            timeout: Duration::from_millis(env_or(ENV_BATCH_TIMEOUT_MS, DEFAULT_BATCH_TIMEOUT_MS)),
        }
    }
}

/// PostgreSQL connection pool configuration for the read/append path
/// (distinct from the dedicated `LISTEN` connection; see §5 "Connection
/// discipline").
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub statement_timeout_secs: u64,
}

impl PostgresConfig {
    /// Build configuration from an explicit URL, with SaaS-sized
    /// connection pool defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: POSTGRES_DEFAULT_MAX_CONNECTIONS,
            min_connections: POSTGRES_DEFAULT_MIN_CONNECTIONS,
            acquire_timeout_secs: POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS,
            idle_timeout_secs: POSTGRES_DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifetime_secs: POSTGRES_DEFAULT_MAX_LIFETIME_SECS,
            statement_timeout_secs: POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS,
        }
    }

    /// Build configuration from the `DBOS_STREAM_POSTGRES_URL` environment
    /// variable.
    pub fn from_env() -> Option<Self> {
        env::var(ENV_POSTGRES_URL).ok().map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_pool_config_defaults() {
        let config = ListenerPoolConfig::default();
        assert_eq!(config.pool_size, POOL_SIZE);
        assert_eq!(config.max_streams_per_listener, MAX_STREAMS_PER_LISTENER);
        assert_eq!(config.max_reader_retries, MAX_READER_RETRIES);
    }

    #[test]
    fn batch_defaults_match_spec_constants() {
        let defaults = BatchDefaults::default();
        assert_eq!(defaults.max_size, DEFAULT_BATCH_MAX_SIZE);
        assert_eq!(
            defaults.timeout,
            Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS)
        );
    }

    #[test]
    fn postgres_config_new_applies_saas_defaults() {
        let config = PostgresConfig::new("postgres://localhost/test");
        assert_eq!(config.max_connections, POSTGRES_DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.min_connections, POSTGRES_DEFAULT_MIN_CONNECTIONS);
    }
}
