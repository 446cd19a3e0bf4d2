//! Public façade: `subscribe`, `publish`, `create_pipe`, `unsubscribe`,
//! `get_stats`, `close`. Applies per-subscriber batching on top of the
//! raw fan-out output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::config::ListenerPoolConfig;
use super::StreamId;
use super::accumulator::{self, BatchStream};
use super::error::BridgeError;
use super::pool::PoolStats;
use super::store::EventStore;
use super::subscriber::{PublishCleanup, StreamSubscriber};

const PIPE_BUFFER: usize = 256;

/// Options for [`StreamBridge::subscribe`]. Omitting both `max_size` and
/// `timeout_ms` returns the raw 1:1 fan-out.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub workflow_id: Arc<str>,
    pub stream_key: Arc<str>,
    pub from_offset: Option<i64>,
    pub max_size: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl SubscribeOptions {
    pub fn new(workflow_id: impl Into<Arc<str>>, stream_key: impl Into<Arc<str>>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stream_key: stream_key.into(),
            from_offset: None,
            max_size: None,
            timeout_ms: None,
        }
    }

    pub fn from_offset(mut self, offset: i64) -> Self {
        self.from_offset = Some(offset);
        self
    }

    pub fn batched(mut self, max_size: usize, timeout_ms: u64) -> Self {
        self.max_size = Some(max_size);
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// The three handles returned by [`StreamBridge::create_pipe`].
pub struct Pipe {
    pub input: mpsc::Sender<Value>,
    pub output: BatchStream,
    input_cleanup: PublishCleanup,
    output_stream_id: StreamId,
    subscriber: Arc<StreamSubscriber>,
}

impl Pipe {
    pub async fn close(self) {
        self.input_cleanup.stop().await;
        self.subscriber.unsubscribe(&self.output_stream_id).await;
    }
}

pub struct StreamBridge {
    subscriber: Arc<StreamSubscriber>,
    closed: AtomicBool,
}

impl StreamBridge {
    pub fn new(store: Arc<dyn EventStore>, config: ListenerPoolConfig) -> Self {
        Self {
            subscriber: Arc::new(StreamSubscriber::new(store, config)),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.subscriber.initialize().await.map_err(Into::into)
    }

    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<BatchStream, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }
        let stream_id = StreamId::new(options.workflow_id, options.stream_key);
        let fanout = self
            .subscriber
            .subscribe(&stream_id, options.from_offset.unwrap_or(0))
            .await?;
        let raw = fanout.subscribe();
        Ok(accumulator::wrap(raw, options.max_size, options.timeout_ms))
    }

    pub fn publish<T>(
        &self,
        workflow_id: impl Into<Arc<str>>,
        stream_key: impl Into<Arc<str>>,
        source: mpsc::Receiver<T>,
    ) -> Result<PublishCleanup, BridgeError>
    where
        T: Serialize + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::PublishClosed);
        }
        Ok(self.subscriber.publish_from_channel(workflow_id, stream_key, source))
    }

    /// `{ input, output, close }`: `input` is a writable in-memory
    /// channel bridged to the input stream, `output` is a batched
    /// fan-out on the output stream.
    pub async fn create_pipe(
        &self,
        workflow_id: impl Into<Arc<str>>,
        input_key: impl Into<Arc<str>>,
        output_key: impl Into<Arc<str>>,
    ) -> Result<Pipe, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }
        let workflow_id = workflow_id.into();
        let (tx, rx) = mpsc::channel::<Value>(PIPE_BUFFER);
        let input_cleanup = self
            .subscriber
            .publish_from_channel(workflow_id.clone(), input_key, rx);

        let output_stream_id = StreamId::new(workflow_id, output_key);
        let fanout = self.subscriber.subscribe(&output_stream_id, 0).await?;
        let output = accumulator::wrap(fanout.subscribe(), None, None);

        Ok(Pipe {
            input: tx,
            output,
            input_cleanup,
            output_stream_id,
            subscriber: Arc::clone(&self.subscriber),
        })
    }

    pub async fn unsubscribe(&self, workflow_id: &str, stream_key: &str) {
        self.subscriber
            .unsubscribe(&StreamId::new(workflow_id, stream_key))
            .await;
    }

    pub fn get_stats(&self) -> PoolStats {
        self.subscriber.pool().stats()
    }

    /// Registers a per-stream-key decoder that every listener in the pool
    /// applies to a raw row's JSON before it reaches a subscriber's
    /// batch. Used to unwrap an adapter-specific envelope (e.g. the event
    /// bus's `event_payload` field) ahead of the generic fan-out.
    pub fn register_deserialiser<F>(&self, stream_key: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Clone + Send + Sync + 'static,
    {
        self.subscriber.pool().register_deserialiser(stream_key, f);
    }

    /// Idempotent. After close, `subscribe` fails with
    /// [`BridgeError::Closed`] and `publish`/`create_pipe` fail with
    /// [`BridgeError::PublishClosed`]/[`BridgeError::Closed`] rather than
    /// silently starting fresh work against a bridge the caller has torn
    /// down.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriber.close().await;
    }
}
