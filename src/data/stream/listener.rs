//! Owns one `LISTEN` connection, maintains per-stream channel state, and
//! runs one reader loop per active stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::config::ListenerPoolConfig;
use super::StreamEvent;
use super::StreamFanOut;
use super::StreamId;
use super::error::ListenerError;
use super::store::{EventStore, NotifyConnection, StoreError};

type Deserialiser = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

enum CleanupSlot {
    Idle,
    InProgress(Shared<BoxFuture<'static, ()>>),
    Done,
}

enum ListenCommand {
    Listen(String, oneshot::Sender<Result<(), StoreError>>),
    Unlisten(String, oneshot::Sender<Result<(), StoreError>>),
}

/// Per-stream state held inside a listener. See `StreamId` docs for the
/// identifier this is keyed by.
struct ChannelState {
    stream_id: StreamId,
    fanout: Arc<StreamFanOut>,
    local_offset: AtomicI64,
    remote_offset: AtomicI64,
    consumer_count: AtomicUsize,
    wake_up: Notify,
    cleaning_up: AtomicBool,
    cleanup_slot: SyncMutex<CleanupSlot>,
    reader_task: SyncMutex<Option<JoinHandle<()>>>,
    created_at: Instant,
}

impl ChannelState {
    fn new(stream_id: StreamId, from_offset: i64) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            fanout: Arc::new(StreamFanOut::new()),
            local_offset: AtomicI64::new(from_offset),
            remote_offset: AtomicI64::new(from_offset - 1),
            consumer_count: AtomicUsize::new(0),
            wake_up: Notify::new(),
            cleaning_up: AtomicBool::new(false),
            cleanup_slot: SyncMutex::new(CleanupSlot::Idle),
            reader_task: SyncMutex::new(None),
            created_at: Instant::now(),
        })
    }
}

/// Snapshot of a listener's load, used by the pool for routing decisions.
#[derive(Debug, Clone, Copy)]
pub struct ListenerStats {
    pub stream_count: usize,
    pub consumer_count: usize,
}

pub struct NotificationListener {
    pub id: usize,
    store: Arc<dyn EventStore>,
    config: ListenerPoolConfig,
    channels: SyncMutex<HashMap<StreamId, Arc<ChannelState>>>,
    deserialisers: SyncMutex<HashMap<String, Deserialiser>>,
    cmd_tx: SyncMutex<Option<mpsc::UnboundedSender<ListenCommand>>>,
    dispatch_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    pub fn new(id: usize, store: Arc<dyn EventStore>, config: ListenerPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            store,
            config,
            channels: SyncMutex::new(HashMap::new()),
            deserialisers: SyncMutex::new(HashMap::new()),
            cmd_tx: SyncMutex::new(None),
            dispatch_task: SyncMutex::new(None),
        })
    }

    /// Open the listening connection and start its dispatch loop.
    /// Idempotent: a second call is a no-op while the dispatch task is
    /// alive.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ListenerError> {
        if self.cmd_tx.lock().is_some() {
            return Ok(());
        }

        let conn = self.connect_with_retry().await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock() = Some(cmd_tx);

        let listener = Arc::clone(self);
        let handle = tokio::spawn(async move { listener.run_dispatch(conn, cmd_rx).await });
        *self.dispatch_task.lock() = Some(handle);
        Ok(())
    }

    async fn connect_with_retry(&self) -> Result<Box<dyn NotifyConnection>, ListenerError> {
        let mut attempts = 0u32;
        loop {
            match self.store.connect_listener().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    attempts += 1;
                    if attempts > self.config.retry_limit {
                        tracing::error!(listener = self.id, %err, "listening connection permanently unavailable");
                        return Err(ListenerError::ConnectionLost);
                    }
                    tracing::warn!(listener = self.id, %err, attempts, "listen connect failed, retrying");
                    tokio::time::sleep(self.config.retry_timeout).await;
                }
            }
        }
    }

    async fn run_dispatch(
        self: Arc<Self>,
        mut conn: Box<dyn NotifyConnection>,
        mut cmd_rx: mpsc::UnboundedReceiver<ListenCommand>,
    ) {
        let mut health_check = tokio::time::interval(self.config.health_check_interval);
        health_check.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ListenCommand::Listen(channel, reply)) => {
                            let _ = reply.send(conn.listen(&channel).await);
                        }
                        Some(ListenCommand::Unlisten(channel, reply)) => {
                            let _ = reply.send(conn.unlisten(&channel).await);
                        }
                        None => {
                            tracing::debug!(listener = self.id, "command channel closed, stopping dispatch");
                            return;
                        }
                    }
                }
                _ = health_check.tick() => {
                    tracing::debug!(listener = self.id, "listener health check tick");
                }
                notification = conn.recv() => {
                    match notification {
                        Ok(n) => self.handle_notification(&n.channel, &n.payload),
                        Err(err) => {
                            tracing::warn!(listener = self.id, %err, "listening connection lost, reconnecting");
                            match self.reconnect_and_relisten().await {
                                Ok(new_conn) => conn = new_conn,
                                Err(_) => {
                                    self.propagate_connection_lost();
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn reconnect_and_relisten(&self) -> Result<Box<dyn NotifyConnection>, ListenerError> {
        let mut conn = self.connect_with_retry().await?;
        let channels: Vec<String> = self
            .channels
            .lock()
            .keys()
            .map(StreamId::channel_name)
            .collect();
        for channel in channels {
            if let Err(err) = conn.listen(&channel).await {
                tracing::warn!(listener = self.id, %channel, %err, "failed to re-listen after reconnect");
            }
        }
        Ok(conn)
    }

    fn propagate_connection_lost(&self) {
        let channels = self.channels.lock();
        for state in channels.values() {
            state.fanout.set_error(ListenerError::ConnectionLost);
        }
    }

    fn handle_notification(&self, channel: &str, payload: &str) {
        let Some(stream_id) = StreamId::parse_channel_name(channel) else {
            return;
        };
        let offset = serde_json::from_str::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| v.get("offset").and_then(Value::as_i64));
        let Some(offset) = offset else {
            tracing::warn!(%channel, %payload, "notification payload missing offset");
            return;
        };

        let channels = self.channels.lock();
        if let Some(state) = channels.get(&stream_id) {
            state.remote_offset.fetch_max(offset, Ordering::SeqCst);
            state.wake_up.notify_one();
        }
    }

    /// Associate a per-stream-key decoder. Unknown keys fall back to
    /// identity decode.
    pub fn register_deserialiser<F>(&self, stream_key: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.deserialisers.lock().insert(stream_key.into(), Arc::new(f));
    }

    fn decoder_for(&self, stream_key: &str) -> Deserialiser {
        self.deserialisers
            .lock()
            .get(stream_key)
            .cloned()
            .unwrap_or_else(|| Arc::new(|v: &Value| Ok(v.clone())))
    }

    /// Returns the (new or shared) fan-out for the stream.
    pub async fn subscribe(
        self: &Arc<Self>,
        stream_id: &StreamId,
        from_offset: i64,
    ) -> Result<Arc<StreamFanOut>, ListenerError> {
        let existing = self.channels.lock().get(stream_id).cloned();
        if let Some(state) = existing {
            state.consumer_count.fetch_add(1, Ordering::SeqCst);
            return Ok(state.fanout.clone());
        }

        let state = ChannelState::new(stream_id.clone(), from_offset);
        state.consumer_count.store(1, Ordering::SeqCst);
        // Registered before LISTEN is confirmed so a notification racing
        // with registration is never silently dropped: the reader's
        // initial catch-up pass covers any offset such a notification
        // would have announced.
        self.channels.lock().insert(stream_id.clone(), Arc::clone(&state));

        let channel_name = stream_id.channel_name();
        if let Err(err) = self.send_listen_command(channel_name, true).await {
            self.channels.lock().remove(stream_id);
            return Err(err);
        }

        let reader = spawn_reader(Arc::clone(self), Arc::clone(&state));
        *state.reader_task.lock() = Some(reader);

        Ok(state.fanout.clone())
    }

    async fn send_listen_command(&self, channel: String, listen: bool) -> Result<(), ListenerError> {
        let tx = self.cmd_tx.lock().clone();
        let Some(tx) = tx else {
            return Err(ListenerError::ConnectionLost);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = if listen {
            ListenCommand::Listen(channel, reply_tx)
        } else {
            ListenCommand::Unlisten(channel, reply_tx)
        };
        if tx.send(cmd).is_err() {
            return Err(ListenerError::ConnectionLost);
        }
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ListenerError::ConnectionLost),
        }
    }

    /// Decrement `consumer_count`; when it reaches zero, trigger cleanup.
    /// Cleanup is idempotent and shared across concurrent last-unsubscribers.
    pub async fn unsubscribe(self: &Arc<Self>, stream_id: &StreamId) {
        let state = self.channels.lock().get(stream_id).cloned();
        let Some(state) = state else {
            return;
        };

        let remaining = state.consumer_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            return;
        }

        let fut = {
            let mut slot = state.cleanup_slot.lock();
            match &*slot {
                CleanupSlot::Done => None,
                CleanupSlot::InProgress(fut) => Some(fut.clone()),
                CleanupSlot::Idle => {
                    let listener = Arc::clone(self);
                    let state2 = Arc::clone(&state);
                    let stream_id2 = stream_id.clone();
                    let fut: BoxFuture<'static, ()> =
                        Box::pin(async move { listener.cleanup(&stream_id2, state2).await });
                    let shared = fut.shared();
                    *slot = CleanupSlot::InProgress(shared.clone());
                    Some(shared)
                }
            }
        };

        if let Some(fut) = fut {
            fut.await;
            *state.cleanup_slot.lock() = CleanupSlot::Done;
        }
    }

    async fn cleanup(&self, stream_id: &StreamId, state: Arc<ChannelState>) {
        state.cleaning_up.store(true, Ordering::SeqCst);
        state.wake_up.notify_waiters();

        let reader = state.reader_task.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        state.fanout.close();
        let _ = self.send_listen_command(stream_id.channel_name(), false).await;
        self.channels.lock().remove(stream_id);
        tracing::debug!(
            listener = self.id,
            stream = %stream_id,
            lifetime_secs = state.created_at.elapsed().as_secs_f64(),
            "stream cleanup complete"
        );
    }

    pub fn stream_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn contains(&self, stream_id: &StreamId) -> bool {
        self.channels.lock().contains_key(stream_id)
    }

    pub fn stats(&self) -> ListenerStats {
        let channels = self.channels.lock();
        ListenerStats {
            stream_count: channels.len(),
            consumer_count: channels
                .values()
                .map(|s| s.consumer_count.load(Ordering::SeqCst))
                .sum(),
        }
    }

    /// Stop every reader, close every fan-out, `UNLISTEN` every channel,
    /// close the connection.
    pub async fn close(self: &Arc<Self>) {
        let stream_ids: Vec<StreamId> = self.channels.lock().keys().cloned().collect();
        for stream_id in stream_ids {
            // force consumer_count to zero so unsubscribe tears it down,
            // regardless of how many consumers are still attached.
            if let Some(state) = self.channels.lock().get(&stream_id).cloned() {
                state.consumer_count.store(1, Ordering::SeqCst);
            }
            self.unsubscribe(&stream_id).await;
        }

        self.cmd_tx.lock().take();
        if let Some(handle) = self.dispatch_task.lock().take() {
            let _ = handle.await;
        }
    }
}

fn spawn_reader(listener: Arc<NotificationListener>, state: Arc<ChannelState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending_catchup = true;
        let mut retries = 0u32;

        loop {
            if state.cleaning_up.load(Ordering::SeqCst) {
                return;
            }

            let local = state.local_offset.load(Ordering::SeqCst);
            let remote = state.remote_offset.load(Ordering::SeqCst);
            let should_read = pending_catchup || local <= remote;

            if !should_read {
                state.wake_up.notified().await;
                continue;
            }

            match listener
                .store
                .read_range(&state.stream_id, local, listener.config.query_batch_size)
                .await
            {
                Ok(rows) => {
                    retries = 0;
                    if rows.is_empty() {
                        if pending_catchup {
                            pending_catchup = false;
                        }
                        continue;
                    }

                    let count = rows.len() as i64;
                    let decoder = listener.decoder_for(&state.stream_id.stream_key);
                    let batch: Vec<StreamEvent> = rows
                        .into_iter()
                        .filter_map(|row| match decoder(&row.value) {
                            Ok(value) => Some(StreamEvent { offset: row.offset, value }),
                            Err(reason) => {
                                tracing::warn!(
                                    workflow_id = %state.stream_id.workflow_id,
                                    stream_key = %state.stream_id.stream_key,
                                    offset = row.offset,
                                    reason,
                                    "failed to decode stream row, skipping"
                                );
                                None
                            }
                        })
                        .collect();

                    if !batch.is_empty() && !state.fanout.send(batch) {
                        return;
                    }
                    state.local_offset.store(local + count, Ordering::SeqCst);
                }
                Err(err) => {
                    retries += 1;
                    tracing::warn!(
                        workflow_id = %state.stream_id.workflow_id,
                        stream_key = %state.stream_id.stream_key,
                        retries,
                        %err,
                        "reader query failed"
                    );
                    if retries > listener.config.max_reader_retries {
                        state.fanout.set_error(ListenerError::RetriesExhausted);
                        return;
                    }
                    tokio::select! {
                        _ = state.wake_up.notified() => {}
                        _ = tokio::time::sleep(listener.config.reader_backoff) => {}
                    }
                }
            }
        }
    })
}
