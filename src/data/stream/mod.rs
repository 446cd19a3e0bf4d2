//! Execution-event streaming core.
//!
//! Data flow for subscribe: [`bridge::StreamBridge`] → [`subscriber::StreamSubscriber`]
//! → [`pool::ListenerPool`] → [`listener::NotificationListener`] →
//! [`fanout::FanOutChannel`] → optional [`accumulator::Accumulator`] → caller.
//! Data flow for publish: caller's channel → `StreamSubscriber` publish
//! task → [`store::EventStore::append`] → database `NOTIFY` →
//! `NotificationListener` → the stream's `FanOutChannel`s.

pub mod accumulator;
pub mod bridge;
pub mod error;
pub mod event_bus;
pub mod fanout;
pub mod listener;
pub mod memory;
pub mod pool;
pub mod store;
pub mod subscriber;

use std::sync::Arc;

use serde_json::Value;

use crate::core::constants::NOTIFICATION_CHANNEL_PREFIX;
use error::ListenerError;
use fanout::FanOutChannel;

/// One decoded row, as handed to subscribers. Keeping the offset attached
/// (rather than surfacing only the bare value) is what lets a caller, or
/// a test, verify the no-gaps/no-duplicates ordering guarantee directly
/// off the batches it received.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub offset: i64,
    pub value: Value,
}

/// A decoded batch of stream values, in offset order, as handed to
/// subscribers (raw batches correspond 1:1 to store read batches unless
/// an [`accumulator::Accumulator`] re-batches them).
pub type Batch = Vec<StreamEvent>;

/// The fan-out type every stream is backed by: batches of decoded
/// values, or a listener error if the stream's reader gave up.
pub type StreamFanOut = FanOutChannel<Batch, ListenerError>;

/// `(workflow_id, stream_key)` — identifies a logically independent
/// append-only sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub workflow_id: Arc<str>,
    pub stream_key: Arc<str>,
}

impl StreamId {
    pub fn new(workflow_id: impl Into<Arc<str>>, stream_key: impl Into<Arc<str>>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stream_key: stream_key.into(),
        }
    }

    /// The database notification channel name: `<prefix><workflow_id>_<stream_key>`.
    pub fn channel_name(&self) -> String {
        format!(
            "{NOTIFICATION_CHANNEL_PREFIX}{}_{}",
            self.workflow_id, self.stream_key
        )
    }

    /// The string hashed for consistent-hash routing: `<workflow_id>:<stream_key>`.
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.stream_key)
    }

    /// Inverse of [`Self::channel_name`]: strip the prefix, split on the
    /// first `_`, first token is `workflow_id`, remainder (rejoined) is
    /// `stream_key` — so `stream_key` values containing `_` round-trip.
    pub fn parse_channel_name(channel: &str) -> Option<Self> {
        let rest = channel.strip_prefix(NOTIFICATION_CHANNEL_PREFIX)?;
        let (workflow_id, stream_key) = rest.split_once('_')?;
        if workflow_id.is_empty() || stream_key.is_empty() {
            return None;
        }
        Some(Self::new(workflow_id, stream_key))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workflow_id, self.stream_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_round_trips() {
        let id = StreamId::new("abc-123", "events");
        let channel = id.channel_name();
        assert_eq!(channel, "dbos_stream_abc-123_events");
        assert_eq!(StreamId::parse_channel_name(&channel), Some(id));
    }

    #[test]
    fn stream_key_with_underscore_round_trips() {
        let id = StreamId::new("abc-123", "child_events_v2");
        let channel = id.channel_name();
        assert_eq!(StreamId::parse_channel_name(&channel), Some(id));
    }

    #[test]
    fn parse_rejects_foreign_channel() {
        assert_eq!(StreamId::parse_channel_name("some_other_channel"), None);
    }
}
