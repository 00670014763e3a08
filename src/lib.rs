//! seekd: the network-serving core of a full-text search daemon.
//!
//! - Multi-protocol frontend (legacy binary, MySQL-wire, HTTP) over a
//!   listener multiplexor
//! - Length-prefixed framed codec with deferred length backfill
//! - Remote-agent dispatch across mirrored backends with weighted selection,
//!   bounded retries and per-host health dashboards
//! - FIFO pools of persistent agent connections
//! - Shared registry of served indexes with per-index query statistics

pub mod agent;
pub mod config;
pub mod error;
pub mod index;
pub mod net;
pub mod search;
pub mod server;
pub mod wire;

pub use config::Config;
pub use error::NetError;
pub use server::Daemon;
