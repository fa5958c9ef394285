//! Application Layer
//!
//! This module contains:
//! - Demux: first-byte protocol sniffing
//! - Dispatcher: core execution flow (sniff → handler → resolve → relay)
//! - Service: accept loop, admission cap, lifecycle
//! - Metrics: process-wide counters

pub mod demux;
pub mod dispatcher;
pub mod listener;
pub mod metrics;

pub use dispatcher::Dispatcher;
pub use listener::{Service, MAX_SESSIONS};
