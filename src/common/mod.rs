//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Address: network address representation
//! - NetArg: connection context carried from handler to resolver to relay

mod stream;
mod address;
mod netarg;

pub use stream::{IntoStream, PrefixedStream, Stream};
pub use address::Address;
pub use netarg::{DomainType, NetArg};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
