//! Per-subscriber batching wrapper: flattens raw fan-out batches into
//! caller-sized ones, flushing on size or a timeout.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::core::config::BatchDefaults;
use super::Batch;
use super::error::ListenerError;
use super::fanout::FanOutError;

type RawItem = Result<Arc<Batch>, FanOutError<ListenerError>>;
type BatchItem = Result<Batch, FanOutError<ListenerError>>;
pub type BatchStream = Pin<Box<dyn Stream<Item = BatchItem> + Send>>;

/// If neither `max_size` nor `timeout_ms` is given, the raw fan-out is
/// returned unwrapped (1:1 with database read batches). Otherwise the
/// stream is wrapped in an accumulator using the given values, falling
/// back to [`BatchDefaults`] for whichever one is omitted.
pub fn wrap(
    source: Pin<Box<dyn Stream<Item = RawItem> + Send>>,
    max_size: Option<usize>,
    timeout_ms: Option<u64>,
) -> BatchStream {
    if max_size.is_none() && timeout_ms.is_none() {
        return Box::pin(source.map(|item| item.map(|batch| (*batch).clone())));
    }

    let defaults = BatchDefaults::default();
    let max_size = max_size.unwrap_or(defaults.max_size).max(1);
    let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(defaults.timeout);
    accumulate(source, max_size, timeout)
}

fn accumulate(mut source: Pin<Box<dyn Stream<Item = RawItem> + Send>>, max_size: usize, timeout: Duration) -> BatchStream {
    Box::pin(stream! {
        let mut buffer: Batch = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            match deadline {
                None => match source.next().await {
                    Some(Ok(batch)) => {
                        buffer.extend((*batch).iter().cloned());
                        if buffer.len() >= max_size {
                            yield Ok(std::mem::take(&mut buffer));
                        } else {
                            deadline = Some(Instant::now() + timeout);
                        }
                    }
                    Some(Err(err)) => {
                        yield Err(err);
                        return;
                    }
                    None => return,
                },
                Some(at) => {
                    tokio::select! {
                        item = source.next() => {
                            match item {
                                Some(Ok(batch)) => {
                                    buffer.extend((*batch).iter().cloned());
                                    if buffer.len() >= max_size {
                                        yield Ok(std::mem::take(&mut buffer));
                                        deadline = None;
                                    }
                                }
                                Some(Err(err)) => {
                                    if !buffer.is_empty() {
                                        yield Ok(std::mem::take(&mut buffer));
                                    }
                                    yield Err(err);
                                    return;
                                }
                                None => {
                                    if !buffer.is_empty() {
                                        yield Ok(std::mem::take(&mut buffer));
                                    }
                                    return;
                                }
                            }
                        }
                        _ = tokio::time::sleep_until(at) => {
                            yield Ok(std::mem::take(&mut buffer));
                            deadline = None;
                        }
                    }
                }
            }
        }
    })
}
