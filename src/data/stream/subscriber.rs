//! Generic translation layer between in-memory channels and the durable
//! store: bridges DBOS-stream → in-memory-channel (subscribe) and
//! channel → DBOS-stream (publish).

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::config::ListenerPoolConfig;
use super::StreamFanOut;
use super::StreamId;
use super::error::ListenerError;
use super::pool::ListenerPool;
use super::store::EventStore;

struct PublishInner {
    stream_id: StreamId,
    stop_tx: watch::Sender<bool>,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

/// A handle to a background publish bridge. Invoking `stop` signals the
/// task to stop after its current in-flight append and joins it.
/// Cloning shares the same underlying task, so the subscriber and the
/// original caller can both hold (and both safely invoke) the same
/// cleanup.
#[derive(Clone)]
pub struct PublishCleanup(Arc<PublishInner>);

impl PublishCleanup {
    pub fn stream_id(&self) -> &StreamId {
        &self.0.stream_id
    }

    pub async fn stop(&self) {
        let _ = self.0.stop_tx.send(true);
        let task = self.0.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

pub struct StreamSubscriber {
    pool: Arc<ListenerPool>,
    store: Arc<dyn EventStore>,
    publish_tasks: SyncMutex<Vec<PublishCleanup>>,
}

impl StreamSubscriber {
    pub fn new(store: Arc<dyn EventStore>, config: ListenerPoolConfig) -> Self {
        let pool = Arc::new(ListenerPool::new(Arc::clone(&store), config));
        Self {
            pool,
            store,
            publish_tasks: SyncMutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ListenerPool> {
        &self.pool
    }

    /// Brings the pool up: eagerly opens every listener's connection.
    pub async fn initialize(&self) -> Result<(), ListenerError> {
        self.pool.connect_all().await
    }

    pub async fn subscribe(
        &self,
        stream_id: &StreamId,
        from_offset: i64,
    ) -> Result<Arc<StreamFanOut>, ListenerError> {
        self.pool.subscribe(stream_id, from_offset).await
    }

    pub async fn unsubscribe(&self, stream_id: &StreamId) {
        self.pool.unsubscribe(stream_id).await;
    }

    /// Starts a background task that iterates `source` and appends each
    /// value to the durable store. Back-pressure: the task waits on each
    /// append before reading the next value, so a slow store naturally
    /// back-pressures the producer via `source`'s own buffering.
    pub fn publish_from_channel<T>(
        &self,
        workflow_id: impl Into<Arc<str>>,
        stream_key: impl Into<Arc<str>>,
        mut source: mpsc::Receiver<T>,
    ) -> PublishCleanup
    where
        T: Serialize + Send + 'static,
    {
        let stream_id = StreamId::new(workflow_id, stream_key);
        let store = Arc::clone(&self.store);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_stream_id = stream_id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    received = source.recv() => {
                        let Some(value) = received else { break };
                        let envelope = match serde_json::to_value(&value) {
                            Ok(value) => serde_json::json!({
                                "workflow_id": task_stream_id.workflow_id,
                                "value": value,
                                "timestamp": chrono::Utc::now().to_rfc3339(),
                            }),
                            Err(err) => {
                                tracing::warn!(stream = %task_stream_id, %err, "failed to serialise published value, dropping");
                                continue;
                            }
                        };
                        if let Err(err) = store.append(&task_stream_id, envelope).await {
                            tracing::warn!(stream = %task_stream_id, %err, "publish bridge append failed, stopping");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(stream = %task_stream_id, "publish bridge finished");
        });

        let cleanup = PublishCleanup(Arc::new(PublishInner {
            stream_id,
            stop_tx,
            task: SyncMutex::new(Some(task)),
        }));
        self.publish_tasks.lock().push(cleanup.clone());
        cleanup
    }

    /// Cancels all publish tasks (best-effort; collects results), then
    /// closes the pool.
    pub async fn close(&self) {
        let tasks = std::mem::take(&mut *self.publish_tasks.lock());
        for task in tasks {
            task.stop().await;
        }
        self.pool.close().await;
    }
}
