//! Workflow event bus: a [`StreamBridge`] specialised to a single fixed
//! stream key (`events`) with its own envelope shape, `{ workflow_id,
//! event_payload, timestamp }`, distinct from the generic publish
//! bridge's `{ workflow_id, value, timestamp }`.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::config::ListenerPoolConfig;
use crate::core::constants::EVENT_BUS_STREAM_KEY;
use super::StreamId;
use super::bridge::{StreamBridge, SubscribeOptions};
use super::error::{BridgeError, ListenerError};
use super::fanout::FanOutError;
use super::store::EventStore;

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Vec<T>, FanOutError<ListenerError>>> + Send>>;

pub struct EventBus {
    bridge: StreamBridge,
    store: Arc<dyn EventStore>,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>, config: ListenerPoolConfig) -> Self {
        let bridge = StreamBridge::new(Arc::clone(&store), config);
        bridge.register_deserialiser(EVENT_BUS_STREAM_KEY, |envelope| {
            envelope
                .get("event_payload")
                .cloned()
                .ok_or_else(|| "envelope missing event_payload".to_string())
        });
        Self { bridge, store }
    }

    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.bridge.initialize().await
    }

    pub async fn publish_event<T>(&self, workflow_id: impl Into<Arc<str>>, event: &T) -> Result<i64, BridgeError>
    where
        T: Serialize,
    {
        let workflow_id = workflow_id.into();
        let stream_id = StreamId::new(workflow_id.clone(), EVENT_BUS_STREAM_KEY);
        let payload = serde_json::to_value(event)
            .map_err(|err| super::store::StoreError::Decode(err.to_string()))?;
        let envelope = serde_json::json!({
            "workflow_id": workflow_id,
            "event_payload": payload,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        Ok(self.store.append(&stream_id, envelope).await?)
    }

    /// `batch` is `(max_size, timeout_ms)`; omit to receive events 1:1 as
    /// the store delivers them.
    pub async fn subscribe_to_events<T>(
        &self,
        workflow_id: impl Into<Arc<str>>,
        from_index: i64,
        batch: Option<(usize, u64)>,
    ) -> Result<EventStream<T>, BridgeError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut options = SubscribeOptions::new(workflow_id, EVENT_BUS_STREAM_KEY).from_offset(from_index);
        if let Some((max_size, timeout_ms)) = batch {
            options = options.batched(max_size, timeout_ms);
        }
        let raw = self.bridge.subscribe(options).await?;
        Ok(Box::pin(raw.map(|item| {
            item.map(|batch| {
                batch
                    .into_iter()
                    .filter_map(|event| match serde_json::from_value::<T>(event.value) {
                        Ok(value) => Some(value),
                        Err(err) => {
                            tracing::warn!(offset = event.offset, %err, "failed to decode event payload, skipping");
                            None
                        }
                    })
                    .collect()
            })
        })))
    }

    pub async fn unsubscribe(&self, workflow_id: &str) {
        self.bridge.unsubscribe(workflow_id, EVENT_BUS_STREAM_KEY).await;
    }

    pub async fn close(&self) {
        self.bridge.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::memory::MemoryEventStore;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TaskCompleted {
        task_id: String,
        ok: bool,
    }

    fn config() -> ListenerPoolConfig {
        ListenerPoolConfig::default()
    }

    #[tokio::test]
    async fn publish_and_subscribe_round_trip() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let bus = EventBus::new(store, config());

        let mut events = bus
            .subscribe_to_events::<TaskCompleted>("w1", 0, None)
            .await
            .unwrap();
        bus.publish_event(
            "w1",
            &TaskCompleted { task_id: "t1".into(), ok: true },
        )
        .await
        .unwrap();

        let batch = events.next().await.unwrap().unwrap();
        assert_eq!(batch, vec![TaskCompleted { task_id: "t1".into(), ok: true }]);
    }

    #[tokio::test]
    async fn subscribe_replays_from_index() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let bus = EventBus::new(store, config());

        for i in 0..3 {
            bus.publish_event("w1", &TaskCompleted { task_id: format!("t{i}"), ok: true })
                .await
                .unwrap();
        }

        let mut events = bus
            .subscribe_to_events::<TaskCompleted>("w1", 1, None)
            .await
            .unwrap();
        let batch = events.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].task_id, "t1");
    }

    #[tokio::test]
    async fn batched_subscribe_flushes_on_max_size() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let bus = EventBus::new(store, config());
        for i in 0..4 {
            bus.publish_event("w1", &TaskCompleted { task_id: format!("t{i}"), ok: true })
                .await
                .unwrap();
        }

        let mut events = bus
            .subscribe_to_events::<TaskCompleted>("w1", 0, Some((2, 10_000)))
            .await
            .unwrap();
        assert_eq!(events.next().await.unwrap().unwrap().len(), 2);
        assert_eq!(events.next().await.unwrap().unwrap().len(), 2);
    }
}
