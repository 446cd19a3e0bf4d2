//! In-process [`EventStore`] used by the test suite and by callers who
//! want to exercise the streaming core without a database. Mirrors
//! `MemoryTopicBackend`'s role as an in-memory stand-in for a
//! network-backed pub/sub, down to using a `broadcast` channel per
//! notification channel instead of polling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::StreamId;
use super::store::{EventStore, Notification, NotifyConnection, StoreError, StoredEntry};

const NOTIFICATION_BUFFER: usize = 1_024;

#[derive(Default)]
struct Inner {
    rows: Mutex<HashMap<StreamId, Vec<Value>>>,
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Inner {
    fn channel_sender(&self, channel: &str) -> broadcast::Sender<Notification> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFICATION_BUFFER).0)
            .clone()
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    inner: Arc<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, stream: &StreamId, value: Value) -> Result<i64, StoreError> {
        let offset = {
            let mut rows = self.inner.rows.lock();
            let entries = rows.entry(stream.clone()).or_default();
            entries.push(value);
            (entries.len() - 1) as i64
        };

        let channel = stream.channel_name();
        let sender = self.inner.channel_sender(&channel);
        let payload = serde_json::json!({ "offset": offset }).to_string();
        let _ = sender.send(Notification { channel, payload });
        Ok(offset)
    }

    async fn read_range(
        &self,
        stream: &StreamId,
        from_offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let rows = self.inner.rows.lock();
        let Some(entries) = rows.get(stream) else {
            return Ok(Vec::new());
        };
        let from = from_offset.max(0) as usize;
        let take = limit.max(0) as usize;
        let out = entries
            .iter()
            .enumerate()
            .skip(from)
            .take(take)
            .map(|(offset, value)| StoredEntry {
                offset: offset as i64,
                value: value.clone(),
            })
            .collect();
        Ok(out)
    }

    async fn connect_listener(&self) -> Result<Box<dyn NotifyConnection>, StoreError> {
        Ok(Box::new(MemoryNotifyConnection::new(self.inner.clone())))
    }
}

struct MemoryNotifyConnection {
    inner: Arc<Inner>,
    incoming_tx: mpsc::UnboundedSender<Notification>,
    incoming_rx: mpsc::UnboundedReceiver<Notification>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl MemoryNotifyConnection {
    fn new(inner: Arc<Inner>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            incoming_tx,
            incoming_rx,
            forwarders: HashMap::new(),
        }
    }
}

#[async_trait]
impl NotifyConnection for MemoryNotifyConnection {
    async fn listen(&mut self, channel: &str) -> Result<(), StoreError> {
        if self.forwarders.contains_key(channel) {
            return Ok(());
        }
        let mut rx = self.inner.channel_sender(channel).subscribe();
        let tx = self.incoming_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.insert(channel.to_string(), handle);
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<(), StoreError> {
        if let Some(handle) = self.forwarders.remove(channel) {
            handle.abort();
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification, StoreError> {
        self.incoming_rx.recv().await.ok_or(StoreError::ChannelClosed)
    }
}

impl Drop for MemoryNotifyConnection {
    fn drop(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}
