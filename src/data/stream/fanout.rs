//! Single-producer, many-consumer in-memory broadcast primitive.
//!
//! Each subscriber gets its own bounded ring buffer (the `broadcast`
//! channel's capacity); a subscriber that falls more than the capacity
//! behind is disconnected with a lag error on its next poll rather than
//! stalling the producer. See `FanOutError::Lagged`.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::core::constants::FANOUT_CONSUMER_CAPACITY;

enum Event<T, E> {
    Batch(Arc<T>),
    Error(Arc<E>),
    Closed,
}

impl<T, E> Clone for Event<T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Batch(v) => Self::Batch(v.clone()),
            Self::Error(e) => Self::Error(e.clone()),
            Self::Closed => Self::Closed,
        }
    }
}

struct Shared<E> {
    closed: bool,
    error: Option<Arc<E>>,
}

/// Error surfaced to a fan-out consumer.
#[derive(Debug)]
pub enum FanOutError<E> {
    /// The consumer fell more than the channel capacity behind the
    /// producer; `n` batches were dropped for this consumer specifically.
    Lagged(u64),
    /// The producer called `set_error`; the stream terminates after this.
    Source(Arc<E>),
}

impl<E: std::fmt::Display> std::fmt::Display for FanOutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lagged(n) => write!(f, "consumer lagged, {n} batches dropped"),
            Self::Source(e) => write!(f, "upstream error: {e}"),
        }
    }
}

/// Multi-consumer in-memory queue: a single producer, N consumers, each
/// getting every value sent after they subscribed, in order.
pub struct FanOutChannel<T, E> {
    sender: broadcast::Sender<Event<T, E>>,
    shared: Arc<Mutex<Shared<E>>>,
}

impl<T, E> Default for FanOutChannel<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> FanOutChannel<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FANOUT_CONSUMER_CAPACITY);
        Self {
            sender,
            shared: Arc::new(Mutex::new(Shared {
                closed: false,
                error: None,
            })),
        }
    }

    /// Deliver `value` to every currently-registered consumer.
    ///
    /// Returns `false` if the channel is closed or in an error state;
    /// otherwise always succeeds, even if there are currently no
    /// consumers at all (the producer never waits on a consumer).
    pub fn send(&self, value: T) -> bool {
        let shared = self.shared.lock();
        if shared.closed || shared.error.is_some() {
            return false;
        }
        drop(shared);
        let _ = self.sender.send(Event::Batch(Arc::new(value)));
        true
    }

    /// Idempotent. After close, consumers drain any already-buffered
    /// values and then terminate.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        if shared.closed || shared.error.is_some() {
            return;
        }
        shared.closed = true;
        drop(shared);
        let _ = self.sender.send(Event::Closed);
    }

    /// Idempotent. The error becomes visible to consumers after they
    /// drain already-buffered values.
    pub fn set_error(&self, err: E) {
        let mut shared = self.shared.lock();
        if shared.closed || shared.error.is_some() {
            return;
        }
        let err = Arc::new(err);
        shared.error = Some(err.clone());
        drop(shared);
        let _ = self.sender.send(Event::Error(err));
    }

    pub fn is_closed(&self) -> bool {
        let shared = self.shared.lock();
        shared.closed || shared.error.is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// A new stream positioned at the current producer head; historical
    /// replay is the caller's job (read the durable store from an
    /// explicit offset), not this buffer's.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = Result<Arc<T>, FanOutError<E>>> + Send>> {
        let mut rx = self.sender.subscribe();
        let shared = self.shared.clone();

        Box::pin(stream! {
            let initial = {
                let guard = shared.lock();
                (guard.error.clone(), guard.closed)
            };
            match initial {
                (Some(err), _) => {
                    yield Err(FanOutError::Source(err));
                    return;
                }
                (None, true) => return,
                (None, false) => {}
            }
            loop {
                match rx.recv().await {
                    Ok(Event::Batch(v)) => yield Ok(v),
                    Ok(Event::Error(e)) => {
                        yield Err(FanOutError::Source(e));
                        return;
                    }
                    Ok(Event::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(n)) => yield Err(FanOutError::Lagged(n)),
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Debug)]
    struct Boom;
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    #[tokio::test]
    async fn delivers_values_in_order() {
        let chan: FanOutChannel<i32, Boom> = FanOutChannel::new();
        let mut sub = chan.subscribe();
        chan.send(1);
        chan.send(2);
        assert_eq!(*sub.next().await.unwrap().unwrap(), 1);
        assert_eq!(*sub.next().await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn close_drains_then_terminates() {
        let chan: FanOutChannel<i32, Boom> = FanOutChannel::new();
        let mut sub = chan.subscribe();
        chan.send(1);
        chan.close();
        assert_eq!(*sub.next().await.unwrap().unwrap(), 1);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn error_is_visible_after_drain() {
        let chan: FanOutChannel<i32, Boom> = FanOutChannel::new();
        let mut sub = chan.subscribe();
        chan.send(1);
        chan.set_error(Boom);
        assert_eq!(*sub.next().await.unwrap().unwrap(), 1);
        assert!(matches!(sub.next().await, Some(Err(FanOutError::Source(_)))));
    }

    #[tokio::test]
    async fn subscribe_after_close_is_already_terminated() {
        let chan: FanOutChannel<i32, Boom> = FanOutChannel::new();
        chan.close();
        let mut sub = chan.subscribe();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_does_not_stall_producer() {
        let chan: FanOutChannel<i32, Boom> = FanOutChannel::new();
        let mut slow = chan.subscribe();
        let mut fast = chan.subscribe();

        for i in 0..(FANOUT_CONSUMER_CAPACITY as i32 + 10) {
            chan.send(i);
        }
        // fast consumer can make progress without draining slow
        assert!(fast.next().await.is_some());
        let lagged = slow.next().await;
        assert!(matches!(lagged, Some(Err(FanOutError::Lagged(_)))));
    }

    #[tokio::test]
    async fn detached_consumer_does_not_block_send() {
        let chan: FanOutChannel<i32, Boom> = FanOutChannel::new();
        let sub = chan.subscribe();
        drop(sub);
        assert!(chan.send(1));
    }
}
