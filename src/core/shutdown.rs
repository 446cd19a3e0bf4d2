//! Centralized shutdown management
//!
//! Coordinates graceful shutdown of the [`crate::data::stream::pool::ListenerPool`]
//! (closing every listener: stop reader tasks, close fan-outs, `UNLISTEN`,
//! drop connections) and any background publish bridges registered by a
//! [`crate::data::stream::subscriber::StreamSubscriber`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::constants::SHUTDOWN_TIMEOUT_SECS;
use crate::data::stream::pool::ListenerPool;

/// Centralized shutdown service for coordinating graceful shutdown of the
/// streaming core.
#[derive(Clone)]
pub struct ShutdownService {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pool: Arc<ListenerPool>,
}

impl ShutdownService {
    pub fn new(pool: Arc<ListenerPool>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            handles: Arc::new(Mutex::new(Vec::new())),
            pool,
        }
    }

    /// Register a background task handle to be awaited during shutdown
    /// (e.g. a publish bridge spawned by [`crate::subscriber::StreamSubscriber`]).
    pub async fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Subscribe to the shutdown signal
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Check if shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown and wait for everything to wind down.
    ///
    /// Shutdown order:
    /// 1. Signal background tasks (publish bridges) to stop accepting work.
    /// 2. Wait for them to finish their in-flight append.
    /// 3. Close the listener pool: every listener stops its readers,
    ///    closes its fan-outs, `UNLISTEN`s every channel, and drops its
    ///    connections.
    pub async fn shutdown(&self) {
        tracing::debug!("initiating graceful shutdown");
        self.trigger();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let task_count = handles.len();
        tracing::debug!(count = task_count, "waiting for publish bridges to finish");

        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => tracing::debug!("all publish bridges finished"),
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "timeout waiting for publish bridges"
            ),
        }

        tracing::debug!("closing listener pool");
        self.pool.close().await;
        tracing::debug!("shutdown complete");
    }

    /// Wait for the shutdown signal (e.g. to drive an external server's
    /// graceful shutdown future).
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&v| v).await;
        }
    }

    /// Install OS signal handlers and auto-trigger on Ctrl+C/SIGTERM
    pub fn install_signal_handlers(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::debug!("received Ctrl+C, shutting down"),
                _ = terminate => tracing::debug!("received SIGTERM, shutting down"),
            }

            service.trigger();
        });
    }
}
