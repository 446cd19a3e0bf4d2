//! Durable store boundary.
//!
//! spec treats "append value, notify" and "read rows offset >= N" as
//! primitives provided externally. This module gives that boundary a
//! concrete trait so the listener/pool/fan-out layers above it can be
//! built and tested without a live database in every environment that
//! imports this crate.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::StreamId;

/// A single row as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub offset: i64,
    pub value: Value,
}

/// A decoded `NOTIFY` delivered on a listening connection.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to decode row payload: {0}")]
    Decode(String),
    #[error("notification channel closed")]
    ChannelClosed,
}

impl StoreError {
    /// Whether a reader encountering this error should retry rather than
    /// give up immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::ChannelClosed => true,
            Self::Config(_) | Self::Decode(_) => false,
        }
    }
}

/// A dedicated connection that has issued (or can issue) `LISTEN` on one
/// or more channels and yields notifications as they arrive.
///
/// Mirrors `sqlx::postgres::PgListener`'s shape directly so the
/// production implementation is a thin pass-through.
#[async_trait]
pub trait NotifyConnection: Send {
    async fn listen(&mut self, channel: &str) -> Result<(), StoreError>;
    async fn unlisten(&mut self, channel: &str) -> Result<(), StoreError>;
    async fn recv(&mut self) -> Result<Notification, StoreError>;
}

/// The durable store primitive the streaming core is built on top of.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `value` to the stream, returning the offset assigned.
    /// Triggers a database `NOTIFY` on the stream's channel as a
    /// side effect (the store's job, not the caller's).
    async fn append(&self, stream: &StreamId, value: Value) -> Result<i64, StoreError>;

    /// Read up to `limit` rows with `offset >= from_offset`, ordered by
    /// offset ascending.
    async fn read_range(
        &self,
        stream: &StreamId,
        from_offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredEntry>, StoreError>;

    /// Open a fresh dedicated connection for `LISTEN`/`UNLISTEN`,
    /// distinct from whatever pool backs `append`/`read_range` (see
    /// "Connection discipline").
    async fn connect_listener(&self) -> Result<Box<dyn NotifyConnection>, StoreError>;
}
