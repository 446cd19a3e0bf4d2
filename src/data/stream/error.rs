//! Per-component error types for the streaming core.

use std::sync::Arc;

use thiserror::Error;

use super::store::StoreError;

/// Errors surfaced by a [`super::listener::NotificationListener`] or
/// [`super::pool::ListenerPool`].
#[derive(Error, Debug, Clone)]
pub enum ListenerError {
    #[error("store error: {0}")]
    Store(Arc<StoreError>),
    #[error("listening connection lost and reconnect attempts were exhausted")]
    ConnectionLost,
    #[error("stream not found")]
    StreamNotFound,
    #[error("reader exceeded its retry limit after repeated store errors")]
    RetriesExhausted,
}

impl From<StoreError> for ListenerError {
    fn from(err: StoreError) -> Self {
        Self::Store(Arc::new(err))
    }
}

/// Errors returned by the public [`super::bridge::StreamBridge`] façade.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("cannot subscribe: bridge is closed")]
    Closed,
    #[error("cannot publish: bridge is closed")]
    PublishClosed,
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
