//! Integration tests against the public `StreamBridge`/`EventBus` surface,
//! backed by `MemoryEventStore`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use dbos_streamcore::{
    BridgeError, EventBus, EventStore, ListenerPoolConfig, StoreError, StreamBridge, StreamId,
    SubscribeOptions,
};
use dbos_streamcore::data::stream::store::{NotifyConnection, StoredEntry};

fn config(pool_size: usize, cap: usize) -> ListenerPoolConfig {
    ListenerPoolConfig {
        pool_size,
        max_streams_per_listener: cap,
        reader_backoff: Duration::from_millis(5),
        max_reader_retries: 2,
        ..ListenerPoolConfig::default()
    }
}

async fn seed(store: &dyn EventStore, stream_id: &StreamId, count: i64) {
    for i in 0..count {
        store.append(stream_id, Value::from(i)).await.unwrap();
    }
}

#[tokio::test]
async fn subscribe_from_zero_replays_full_history() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let stream_id = StreamId::new("w1", "events");
    seed(&*store, &stream_id, 10).await;

    let bridge = StreamBridge::new(store, config(2, 1000));
    let mut out = bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();

    let mut offsets = Vec::new();
    while offsets.len() < 10 {
        let batch = out.next().await.unwrap().unwrap();
        offsets.extend(batch.into_iter().map(|e| e.offset));
    }
    assert_eq!(offsets, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn subscribe_from_explicit_offset_skips_earlier_rows() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let stream_id = StreamId::new("w1", "events");
    seed(&*store, &stream_id, 10).await;

    let bridge = StreamBridge::new(store, config(2, 1000));
    let mut out = bridge
        .subscribe(SubscribeOptions::new("w1", "events").from_offset(5))
        .await
        .unwrap();

    let mut offsets = Vec::new();
    while offsets.len() < 5 {
        let batch = out.next().await.unwrap().unwrap();
        offsets.extend(batch.into_iter().map(|e| e.offset));
    }
    assert_eq!(offsets, vec![5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn reactive_delivery_after_subscribing_to_empty_stream() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bridge = StreamBridge::new(Arc::clone(&store), config(2, 1000));

    let mut out = bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();

    for i in 0..3 {
        store
            .append(&StreamId::new("w1", "events"), Value::from(i))
            .await
            .unwrap();
    }

    let mut offsets = Vec::new();
    while offsets.len() < 3 {
        let batch = tokio::time::timeout(Duration::from_secs(1), out.next())
            .await
            .expect("no reactive batch within timeout")
            .unwrap()
            .unwrap();
        offsets.extend(batch.into_iter().map(|e| e.offset));
    }
    assert_eq!(offsets, vec![0, 1, 2]);
}

#[tokio::test]
async fn sticky_routing_keeps_resubscribes_on_the_same_listener() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bridge = StreamBridge::new(store, config(4, 1000));

    bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();
    let first = bridge.get_stats();

    bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();
    let second = bridge.get_stats();

    // The same single stream must always land on the same single listener,
    // so exactly one listener should show a nonzero stream count both times.
    let occupied = |s: &dbos_streamcore::data::stream::pool::PoolStats| {
        s.per_listener.iter().position(|l| l.stream_count > 0)
    };
    assert_eq!(occupied(&first), occupied(&second));
    assert_eq!(second.total_consumers, 2);
}

#[tokio::test]
async fn capacity_never_exceeded_while_pool_has_room() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bridge = StreamBridge::new(store, config(4, 2));

    for i in 0..8 {
        bridge
            .subscribe(SubscribeOptions::new("w1", format!("s{i}")))
            .await
            .unwrap();
    }

    let stats = bridge.get_stats();
    for listener_stats in &stats.per_listener {
        assert!(listener_stats.stream_count <= 2);
    }
}

#[tokio::test]
async fn reference_counted_cleanup_removes_stream_and_closes_fanout() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bridge = StreamBridge::new(store, config(1, 1000));

    let mut first = bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();
    bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();
    assert_eq!(bridge.get_stats().total_consumers, 2);

    bridge.unsubscribe("w1", "events").await;
    assert_eq!(bridge.get_stats().total_consumers, 1);

    bridge.unsubscribe("w1", "events").await;
    tokio::task::yield_now().await;
    assert_eq!(bridge.get_stats().total_consumers, 0);
    assert!(first.next().await.is_none());
}

/// Fails the first `fail_count` `read_range` calls with a transient error,
/// then delegates to the wrapped store for everything else.
struct FlakyStore {
    inner: dbos_streamcore::MemoryEventStore,
    remaining_failures: AtomicUsize,
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn append(&self, stream: &StreamId, value: Value) -> Result<i64, StoreError> {
        self.inner.append(stream, value).await
    }

    async fn read_range(
        &self,
        stream: &StreamId,
        from_offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::ChannelClosed);
        }
        self.inner.read_range(stream, from_offset, limit).await
    }

    async fn connect_listener(&self) -> Result<Box<dyn NotifyConnection>, StoreError> {
        self.inner.connect_listener().await
    }
}

#[tokio::test]
async fn transient_read_errors_recover_without_gaps() {
    let store: Arc<dyn EventStore> = Arc::new(FlakyStore {
        inner: dbos_streamcore::MemoryEventStore::new(),
        remaining_failures: AtomicUsize::new(2),
    });
    let stream_id = StreamId::new("w1", "events");
    seed(&*store, &stream_id, 5).await;

    let bridge = StreamBridge::new(store, config(1, 1000));
    let mut out = bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();

    let mut offsets = Vec::new();
    while offsets.len() < 5 {
        let batch = tokio::time::timeout(Duration::from_secs(2), out.next())
            .await
            .expect("reader should recover within the timeout")
            .unwrap()
            .unwrap();
        offsets.extend(batch.into_iter().map(|e| e.offset));
    }
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn persistent_read_errors_propagate_after_retry_limit() {
    let store: Arc<dyn EventStore> = Arc::new(FlakyStore {
        inner: dbos_streamcore::MemoryEventStore::new(),
        remaining_failures: AtomicUsize::new(usize::MAX),
    });
    let bridge = StreamBridge::new(store, config(1, 1000));
    let mut out = bridge
        .subscribe(SubscribeOptions::new("w1", "events"))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), out.next())
        .await
        .expect("reader should give up within the timeout")
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn create_pipe_writes_input_and_streams_output() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bridge = StreamBridge::new(Arc::clone(&store), config(1, 1000));

    let mut pipe = bridge.create_pipe("w1", "in", "out").await.unwrap();

    // input is a channel bridged to the workflow's input stream.
    pipe.input.send(Value::from(7)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let rows = store.read_range(&StreamId::new("w1", "in"), 0, 10).await.unwrap();
    assert_eq!(rows.len(), 1);

    // output streams whatever the workflow itself appends to the output key.
    store
        .append(&StreamId::new("w1", "out"), Value::from(99))
        .await
        .unwrap();
    let batch = pipe.output.next().await.unwrap().unwrap();
    assert_eq!(batch[0].value, Value::from(99));

    pipe.close().await;
}

#[tokio::test]
async fn closed_bridge_rejects_new_subscribe_publish_and_pipes() {
    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bridge = StreamBridge::new(store, config(1, 1000));
    bridge.close().await;

    let subscribe_result = bridge.subscribe(SubscribeOptions::new("w1", "events")).await;
    assert!(matches!(subscribe_result, Err(BridgeError::Closed)));

    let (_tx, rx) = tokio::sync::mpsc::channel::<Value>(8);
    let publish_result = bridge.publish("w1", "commands", rx);
    assert!(matches!(publish_result, Err(BridgeError::PublishClosed)));

    let pipe_result = bridge.create_pipe("w1", "in", "out").await;
    assert!(matches!(pipe_result, Err(BridgeError::Closed)));
}

#[tokio::test]
async fn event_bus_publish_and_subscribe_round_trip() {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct WorkflowDone {
        workflow_id: String,
    }

    let store: Arc<dyn EventStore> = Arc::new(dbos_streamcore::MemoryEventStore::new());
    let bus = EventBus::new(store, config(1, 1000));

    let mut events = bus
        .subscribe_to_events::<WorkflowDone>("w1", 0, None)
        .await
        .unwrap();
    bus.publish_event("w1", &WorkflowDone { workflow_id: "w1".into() })
        .await
        .unwrap();

    let batch = events.next().await.unwrap().unwrap();
    assert_eq!(batch, vec![WorkflowDone { workflow_id: "w1".into() }]);
}
