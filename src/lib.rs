//! Execution-event streaming core: durable per-workflow streams, reactive
//! PostgreSQL `LISTEN`/`NOTIFY` fan-in, and multi-consumer fan-out.
//!
//! This crate is a library. A host binary is expected to install its own
//! `tracing_subscriber` and construct a [`data::postgres::PostgresEventStore`]
//! (or [`data::stream::memory::MemoryEventStore`] for tests/local dev),
//! build a [`data::stream::bridge::StreamBridge`] or
//! [`data::stream::event_bus::EventBus`] on top of it, and drive shutdown
//! through [`core::shutdown::ShutdownService`].

pub mod core;
pub mod data;
pub mod utils;

pub use core::config::{BatchDefaults, ListenerPoolConfig, PostgresConfig};
pub use core::shutdown::ShutdownService;
pub use data::stream::bridge::{Pipe, StreamBridge, SubscribeOptions};
pub use data::stream::error::{BridgeError, ListenerError};
pub use data::stream::event_bus::EventBus;
pub use data::stream::fanout::FanOutError;
pub use data::stream::memory::MemoryEventStore;
pub use data::stream::store::{EventStore, StoreError};
pub use data::stream::{Batch, StreamEvent, StreamId};
pub use data::PostgresEventStore;
