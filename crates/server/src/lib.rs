//! Standalone host for the voxtile device engine.

pub mod block;
pub mod config;
pub mod foreign;
pub mod host;
pub mod metrics;
pub mod persistence;
pub mod server;
