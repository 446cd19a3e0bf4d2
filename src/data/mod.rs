//! Data storage layer
//!
//! - `stream` — the execution-event streaming core: durable per-workflow
//!   streams, reactive `LISTEN`/`NOTIFY` fan-in, multi-consumer fan-out.
//! - `postgres` — the production [`stream::store::EventStore`] backend.

pub mod postgres;
pub mod stream;

pub use postgres::PostgresEventStore;
pub use stream::bridge::StreamBridge;
pub use stream::event_bus::EventBus;
pub use stream::memory::MemoryEventStore;
pub use stream::store::EventStore;
