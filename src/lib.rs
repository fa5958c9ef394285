//! Eagletun - a multi-protocol tunneling proxy
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! Listener (TCP accept, admission cap)
//! → ProtocolDemux (first-byte sniff)
//! → {SOCKS5, HTTP, ET} handler
//! → DnsResolver (split local/remote, single-flight cache)
//! → Relay (direct dial, or ET tunnel to the relay peer)
//! ```
//!
//! ## Core Principles
//!
//! - Components receive their dependencies explicitly; no process-wide state
//!   beyond the metrics registry
//! - Protocol handlers only parse and reply; connecting and relaying live in
//!   the dispatcher
//! - The resolver owns both DNS caches and the routing policy
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, NetArg
//! ├── obfs.rs          # XOR obfuscator
//! ├── tunnel.rs        # Obfuscated framed byte channel
//! ├── user.rs          # User registry and bandwidth budgets
//! ├── hosts.rs         # Hosts overlay with ad-block sentinel
//! ├── dns/             # Single-flight cache + split resolver
//! ├── geoip.rs         # CIDR → country matcher
//! ├── location.rs      # IP geolocation client
//! ├── protocol/        # SOCKS5, HTTP, ET server + client
//! ├── relay.rs         # Bidirectional byte shuffle with accounting
//! └── app/             # Demux, dispatcher, listener, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Wire plumbing
pub mod obfs;
pub mod tunnel;

// Domain state
pub mod user;
pub mod hosts;
pub mod dns;
pub mod geoip;
pub mod location;

// Protocols and data flow
pub mod protocol;
pub mod relay;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, DomainType, NetArg, Stream};
pub use config::{Config, ProxyStatus};
pub use error::{Error, Result};
