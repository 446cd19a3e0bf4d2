//! Fixed configuration constants for the streaming core
//!
//! These mirror the "Configuration constants (fixed; implementations may
//! allow override at construction)" table: a compiled-in default plus an
//! environment variable that overrides it at construction time, never at
//! runtime.

// =============================================================================
// Application Identity
// =============================================================================

/// Environment variable prefix for all overridable constants below
pub const ENV_PREFIX: &str = "DBOS_STREAM_";

/// Notification channel name prefix. Fixed, never configurable: the spec
/// calls this out explicitly ("The prefix is a fixed constant").
pub const NOTIFICATION_CHANNEL_PREFIX: &str = "dbos_stream_";

// =============================================================================
// Listener pool
// =============================================================================

/// Number of notification listeners in the pool
pub const POOL_SIZE: usize = 10;
pub const ENV_POOL_SIZE: &str = "DBOS_STREAM_POOL_SIZE";

/// Capacity cap per listener for hash-based routing before falling back to
/// least-loaded selection
pub const MAX_STREAMS_PER_LISTENER: usize = 1000;
pub const ENV_MAX_STREAMS_PER_LISTENER: &str = "DBOS_STREAM_MAX_STREAMS_PER_LISTENER";

// =============================================================================
// Listening connection health and reconnect
// =============================================================================

/// Paranoid ping interval on the listening connection, in milliseconds
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
pub const ENV_HEALTH_CHECK_INTERVAL_MS: &str = "DBOS_STREAM_HEALTH_CHECK_INTERVAL_MS";

/// Delay between listen-connection reconnect attempts, in milliseconds
pub const RETRY_TIMEOUT_MS: u64 = 5_000;
pub const ENV_RETRY_TIMEOUT_MS: &str = "DBOS_STREAM_RETRY_TIMEOUT_MS";

/// Maximum listen-connection reconnect attempts before the failure is
/// propagated to every stream owned by that listener
pub const RETRY_LIMIT: u32 = 10;
pub const ENV_RETRY_LIMIT: &str = "DBOS_STREAM_RETRY_LIMIT";

// =============================================================================
// Reader loop
// =============================================================================

/// Maximum rows read from the store per catch-up/reactive query
pub const QUERY_BATCH_SIZE: i64 = 1_000;
pub const ENV_QUERY_BATCH_SIZE: &str = "DBOS_STREAM_QUERY_BATCH_SIZE";

/// Backoff between reader retries after a query error, in milliseconds
pub const READER_BACKOFF_MS: u64 = 1_000;
pub const ENV_READER_BACKOFF_MS: &str = "DBOS_STREAM_READER_BACKOFF_MS";

/// Consecutive query failures tolerated before the reader gives up and
/// propagates the error to the fan-out
pub const MAX_READER_RETRIES: u32 = 3;
pub const ENV_MAX_READER_RETRIES: &str = "DBOS_STREAM_MAX_READER_RETRIES";

// =============================================================================
// Subscriber batching (accumulator)
// =============================================================================

/// Default batch size when a subscriber requests batching without an
/// explicit `max_size`
pub const DEFAULT_BATCH_MAX_SIZE: usize = 100;
pub const ENV_BATCH_MAX_SIZE: &str = "DBOS_STREAM_BATCH_MAX_SIZE";

/// Default flush timeout when a subscriber requests batching without an
/// explicit `timeout_ms`
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 25;
pub const ENV_BATCH_TIMEOUT_MS: &str = "DBOS_STREAM_BATCH_TIMEOUT_MS";

// =============================================================================
// Fan-out
// =============================================================================

/// Per-consumer ring buffer capacity. A consumer more than this many batches
/// behind the producer is disconnected with a lag error rather than
/// stalling the producer.
pub const FANOUT_CONSUMER_CAPACITY: usize = 1_024;

// =============================================================================
// Event bus
// =============================================================================

/// Fixed stream key the event bus adapter specialises `StreamBridge` for
pub const EVENT_BUS_STREAM_KEY: &str = "events";

// =============================================================================
// PostgreSQL connection pool (read/append path, distinct from the
// dedicated LISTEN connection per §5 "Connection discipline")
// =============================================================================

pub const POSTGRES_DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const POSTGRES_DEFAULT_MIN_CONNECTIONS: u32 = 2;
pub const POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const POSTGRES_DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const POSTGRES_DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;
pub const POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 60;

/// Environment variable for the PostgreSQL connection URL
pub const ENV_POSTGRES_URL: &str = "DBOS_STREAM_POSTGRES_URL";

// =============================================================================
// Shutdown
// =============================================================================

/// Graceful shutdown timeout in seconds
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
