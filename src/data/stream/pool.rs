//! Shards streams across a fixed set of [`NotificationListener`]s so the
//! notification fan-in of any single database connection stays bounded.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;

use crate::core::config::ListenerPoolConfig;
use super::StreamFanOut;
use super::StreamId;
use super::error::ListenerError;
use super::listener::{ListenerStats, NotificationListener};
use super::store::EventStore;

/// Aggregated load across the pool, for external monitoring.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub pool_size: usize,
    pub per_listener: Vec<ListenerStats>,
    pub total_consumers: usize,
}

fn fnv1a_32(s: &str) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub struct ListenerPool {
    listeners: Vec<Arc<NotificationListener>>,
    bindings: Mutex<HashMap<StreamId, usize>>,
    max_streams_per_listener: usize,
}

impl ListenerPool {
    pub fn new(store: Arc<dyn EventStore>, config: ListenerPoolConfig) -> Self {
        let listeners = (0..config.pool_size)
            .map(|id| NotificationListener::new(id, Arc::clone(&store), config.clone()))
            .collect();
        Self {
            listeners,
            bindings: Mutex::new(HashMap::new()),
            max_streams_per_listener: config.max_streams_per_listener,
        }
    }

    /// Routing: sticky if already bound; otherwise FNV-1a hash mod N,
    /// falling back to the least-loaded listener if the hash target is
    /// at capacity. Ties break by listener index.
    fn route(&self, stream_id: &StreamId) -> usize {
        let mut bindings = self.bindings.lock();
        if let Some(&idx) = bindings.get(stream_id) {
            return idx;
        }

        let n = self.listeners.len();
        let candidate = (fnv1a_32(&stream_id.routing_key()) as usize) % n;
        let idx = if self.listeners[candidate].stream_count() < self.max_streams_per_listener {
            candidate
        } else {
            (0..n)
                .min_by_key(|&i| (self.listeners[i].stream_count(), i))
                .expect("pool is non-empty")
        };

        bindings.insert(stream_id.clone(), idx);
        idx
    }

    pub async fn subscribe(
        &self,
        stream_id: &StreamId,
        from_offset: i64,
    ) -> Result<Arc<StreamFanOut>, ListenerError> {
        let idx = self.route(stream_id);
        let listener = &self.listeners[idx];
        listener.connect().await?;
        listener.subscribe(stream_id, from_offset).await
    }

    pub async fn unsubscribe(&self, stream_id: &StreamId) {
        let idx = self.bindings.lock().get(stream_id).copied();
        let Some(idx) = idx else { return };

        let listener = &self.listeners[idx];
        listener.unsubscribe(stream_id).await;

        if !listener.contains(stream_id) {
            self.bindings.lock().remove(stream_id);
        }
    }

    pub fn register_deserialiser<F>(&self, stream_key: impl Into<String>, f: F)
    where
        F: Fn(&serde_json::Value) -> Result<serde_json::Value, String> + Clone + Send + Sync + 'static,
    {
        let stream_key = stream_key.into();
        for listener in &self.listeners {
            listener.register_deserialiser(stream_key.clone(), f.clone());
        }
    }

    pub fn stats(&self) -> PoolStats {
        let per_listener: Vec<ListenerStats> = self.listeners.iter().map(|l| l.stats()).collect();
        PoolStats {
            pool_size: self.listeners.len(),
            total_consumers: per_listener.iter().map(|s| s.consumer_count).sum(),
            per_listener,
        }
    }

    /// Closes all listeners in parallel.
    pub async fn close(&self) {
        join_all(self.listeners.iter().map(|l| l.close())).await;
    }

    /// Eagerly opens every listener's `LISTEN` connection instead of
    /// waiting for the first subscribe to each one.
    pub async fn connect_all(&self) -> Result<(), ListenerError> {
        for result in join_all(self.listeners.iter().map(|l| l.connect())).await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::stream::memory::MemoryEventStore;

    fn config(pool_size: usize, cap: usize) -> ListenerPoolConfig {
        ListenerPoolConfig {
            pool_size,
            max_streams_per_listener: cap,
            ..ListenerPoolConfig::default()
        }
    }

    #[test]
    fn fnv1a_matches_known_vector() {
        // "" hashes to the FNV-1a 32-bit offset basis.
        assert_eq!(fnv1a_32(""), 0x811c9dc5);
    }

    #[tokio::test]
    async fn sticky_routing_keeps_same_listener() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let pool = ListenerPool::new(store, config(4, 1000));
        let stream_id = StreamId::new("w1", "events");

        pool.subscribe(&stream_id, 0).await.unwrap();
        let first = *pool.bindings.lock().get(&stream_id).unwrap();
        pool.subscribe(&stream_id, 0).await.unwrap();
        let second = *pool.bindings.lock().get(&stream_id).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn capacity_fallback_routes_to_least_loaded() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        // pool size 2, cap 1: saturate listener 0, new stream must land
        // on listener 1 regardless of its hash.
        let pool = ListenerPool::new(store, config(2, 1));
        let saturating = StreamId::new("w1", "a");
        let target_idx = pool.route(&saturating);
        pool.subscribe(&saturating, 0).await.unwrap();

        // find a stream_id whose hash collides with the now-saturated listener
        let mut collide = None;
        for i in 0..1000 {
            let candidate = StreamId::new("w2", format!("k{i}"));
            let hash = (fnv1a_32(&candidate.routing_key()) as usize) % 2;
            if hash == target_idx {
                collide = Some(candidate);
                break;
            }
        }
        let collide = collide.expect("a colliding key exists within 1000 tries");

        pool.subscribe(&collide, 0).await.unwrap();
        let bound = *pool.bindings.lock().get(&collide).unwrap();
        assert_ne!(bound, target_idx);

        // subsequent subscribes to the same stream stay on the fallback listener
        pool.subscribe(&collide, 0).await.unwrap();
        assert_eq!(*pool.bindings.lock().get(&collide).unwrap(), bound);
    }

    #[tokio::test]
    async fn never_exceeds_capacity_unless_pool_saturated() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let pool = ListenerPool::new(store, config(2, 2));
        for i in 0..8 {
            let id = StreamId::new("w", format!("s{i}"));
            pool.subscribe(&id, 0).await.unwrap();
        }
        let stats = pool.stats();
        for listener_stats in &stats.per_listener {
            assert!(listener_stats.stream_count <= 4);
        }
    }

    #[tokio::test]
    async fn unsubscribe_releases_binding() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let pool = ListenerPool::new(store, config(2, 1000));
        let stream_id = StreamId::new("w1", "events");
        pool.subscribe(&stream_id, 0).await.unwrap();
        assert!(pool.bindings.lock().contains_key(&stream_id));

        pool.unsubscribe(&stream_id).await;
        tokio::task::yield_now().await;
        assert!(!pool.bindings.lock().contains_key(&stream_id));
    }
}
