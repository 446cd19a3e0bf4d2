//! Core application infrastructure

pub mod config;
pub mod constants;
pub mod shutdown;

pub use config::{BatchDefaults, ListenerPoolConfig, PostgresConfig};
pub use shutdown::ShutdownService;
