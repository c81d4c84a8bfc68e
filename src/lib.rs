//! Relaybus - asynchronous service messaging.
//!
//! Two reliability layers over bare transport primitives:
//! - request/reply RPC over a message broker (`rpc`, `transport`)
//! - a durable competing-consumers job bus over a stream store with
//!   consumer groups and per-job status tracking (`bus`, `storage`)

pub mod bus;
pub mod config;
pub mod rpc;
pub mod storage;
pub mod transport;
pub mod utils;
