//! PostgreSQL-backed [`EventStore`]
//!
//! Two connection discipilnes, matching "Connection discipline": a pooled
//! connection for `append`/`read_range` via [`PgPoolOptions`], and a
//! dedicated [`PgListener`] per [`connect_listener`] call for `LISTEN`.
//! Optimized for scalable SaaS deployments with connection pooling,
//! idle/lifetime cycling, and statement timeout protection.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::Row;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions};
use serde_json::Value;
use tracing::log::LevelFilter;

use crate::core::config::PostgresConfig;
use crate::data::stream::StreamId;
use crate::data::stream::store::{EventStore, Notification, NotifyConnection, StoreError, StoredEntry};
use crate::utils::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, retry_with_backoff_async};

const EVENTS_TABLE: &str = "dbos_stream_events";

/// PostgreSQL-backed event store.
///
/// Handles pool initialization, schema bootstrap, and opening dedicated
/// listening connections. Should be created once at startup and shared
/// across every [`crate::data::stream::pool::ListenerPool`] member.
pub struct PostgresEventStore {
    pool: PgPool,
    connect_options: PgConnectOptions,
}

impl PostgresEventStore {
    /// Creates the connection pool with SaaS-sized settings, applies the
    /// schema bootstrap, and retains the parsed connect options so that
    /// `connect_listener` can open dedicated connections later.
    ///
    /// The initial pool connect is retried with exponential backoff, since
    /// at startup the database may still be coming up (e.g. a freshly
    /// scheduled container racing its own dependencies).
    pub async fn init(config: &PostgresConfig) -> Result<Self, StoreError> {
        if config.url.is_empty() {
            return Err(StoreError::Config("PostgreSQL URL is required".into()));
        }

        let mut connect_options: PgConnectOptions = config
            .url
            .parse()
            .map_err(|e| StoreError::Config(format!("invalid PostgreSQL URL: {e}")))?;
        connect_options = connect_options.log_statements(LevelFilter::Trace);
        if config.statement_timeout_secs > 0 {
            connect_options = connect_options.options([(
                "statement_timeout",
                format!("{}s", config.statement_timeout_secs),
            )]);
        }

        let connected_pool: std::sync::Arc<parking_lot::Mutex<Option<PgPool>>> =
            std::sync::Arc::new(parking_lot::Mutex::new(None));
        let connected_pool_slot = connected_pool.clone();
        retry_with_backoff_async(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY_MS, || {
            let connect_options = connect_options.clone();
            let connected_pool_slot = connected_pool_slot.clone();
            async move {
                match PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
                    .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
                    .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
                    .connect_with(connect_options)
                    .await
                {
                    Ok(pool) => {
                        *connected_pool_slot.lock() = Some(pool);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await
        .map_err(|(e, attempts)| {
            tracing::warn!(attempts, "giving up connecting to PostgreSQL");
            StoreError::from(e)
        })?;
        let pool = connected_pool
            .lock()
            .take()
            .expect("retry_with_backoff_async only returns Ok after connected_pool is set");

        ensure_schema(&pool).await?;

        tracing::debug!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "PostgresEventStore initialized"
        );
        Ok(Self { pool, connect_options })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("PostgresEventStore pool closed");
    }
}

async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {EVENTS_TABLE} (
            workflow_id TEXT NOT NULL,
            stream_key TEXT NOT NULL,
            "offset" BIGINT NOT NULL,
            value JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (workflow_id, stream_key, "offset")
        )
        "#
    ))
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl EventStore for PostgresEventStore {
    /// Appends within a transaction holding an advisory lock scoped to
    /// the stream's routing key, so two concurrent appenders to the same
    /// stream can't race on the next offset; the `NOTIFY` goes out in the
    /// same transaction so a reader either sees both the row and the
    /// notification, or neither.
    async fn append(&self, stream: &StreamId, value: Value) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(stream.routing_key())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {EVENTS_TABLE} (workflow_id, stream_key, "offset", value)
            SELECT $1, $2, COALESCE(MAX("offset") + 1, 0), $3
            FROM {EVENTS_TABLE} WHERE workflow_id = $1 AND stream_key = $2
            RETURNING "offset"
            "#
        ))
        .bind(&*stream.workflow_id)
        .bind(&*stream.stream_key)
        .bind(&value)
        .fetch_one(&mut *tx)
        .await?;
        let offset: i64 = row.try_get("offset")?;

        let payload = serde_json::json!({ "offset": offset }).to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(stream.channel_name())
            .bind(&payload)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(offset)
    }

    async fn read_range(
        &self,
        stream: &StreamId,
        from_offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT "offset", value FROM {EVENTS_TABLE}
            WHERE workflow_id = $1 AND stream_key = $2 AND "offset" >= $3
            ORDER BY "offset" ASC
            LIMIT $4
            "#
        ))
        .bind(&*stream.workflow_id)
        .bind(&*stream.stream_key)
        .bind(from_offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let offset: i64 = row.try_get("offset")?;
                let value: Value = row.try_get("value")?;
                Ok(StoredEntry { offset, value })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn connect_listener(&self) -> Result<Box<dyn NotifyConnection>, StoreError> {
        let dedicated_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options.clone())
            .await?;
        let listener = PgListener::connect_with(&dedicated_pool).await?;
        Ok(Box::new(PostgresNotifyConnection { inner: listener }))
    }
}

/// Thin pass-through to [`PgListener`]; its `listen`/`unlisten`/`recv`
/// shape is exactly [`NotifyConnection`]'s.
struct PostgresNotifyConnection {
    inner: PgListener,
}

#[async_trait]
impl NotifyConnection for PostgresNotifyConnection {
    async fn listen(&mut self, channel: &str) -> Result<(), StoreError> {
        self.inner.listen(channel).await.map_err(StoreError::from)
    }

    async fn unlisten(&mut self, channel: &str) -> Result<(), StoreError> {
        self.inner.unlisten(channel).await.map_err(StoreError::from)
    }

    async fn recv(&mut self) -> Result<Notification, StoreError> {
        let notification = self.inner.recv().await?;
        Ok(Notification {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    // PostgresEventStore needs a live database; exercised as an
    // integration test outside this crate's unit test run.
}
