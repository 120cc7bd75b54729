//! forwarder-server
//!
//! Async PV forwarder service: consumes JSON commands from a command log,
//! subscribes to PV sources and publishes their updates to a data log.

pub mod config;
pub mod types;
pub mod transport;
pub mod provider;
pub mod source;
pub mod publisher;
pub mod readiness;
pub mod server;

// internal modules, not re-exported
mod command_consumer;
mod controller;

pub use server::{join_or_interrupt, join_until, shutdown_signal, spawn, ForwarderHandle};
pub use types::{ForwarderReport, ServiceState};
