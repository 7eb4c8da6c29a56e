//! [`fleet_monitor::RemoteEngine`] backed by the automation engine's Unix
//! socket, speaking the `fleet_core::engine_ipc` NDJSON contract.

mod client;
mod config;
mod connection;

pub use client::{EngineClient, EngineClientError};
pub use config::EngineClientConfig;
