//! ET - the obfuscated relay sub-protocol.
//!
//! Text lines over a XOR-obfuscated TCP stream. One session is:
//!
//! ```text
//! C→S  eagle_tunnel 1.3\n
//! C→S  <user-id> <password-hash>\n
//! S→C  OK\n                        (or VersionMismatch / AuthFailed)
//! C→S  <cmd> <args...>\n           (DNS / LOCATION / TCP)
//! S→C  <reply>\n
//! ...  raw relayed bytes after a confirmed TCP command
//! ```
//!
//! The auth line is always present; when user-check is off the server
//! accepts any credentials without consulting the registry.

mod server;
mod client;

pub use client::EtClient;
pub use server::EtServer;

/// Fixed version banner. A peer speaking anything else is turned away.
pub const BANNER: &str = "eagle_tunnel 1.3";

/// Reply tokens
pub const REPLY_OK: &str = "OK";
pub const REPLY_FAIL: &str = "Fail";
pub const REPLY_UNKNOWN: &str = "Unknown";
pub const REPLY_AUTH_FAILED: &str = "AuthFailed";
pub const REPLY_VERSION_MISMATCH: &str = "VersionMismatch";

/// Credentials sent when no local user is configured.
pub const ANONYMOUS_AUTH: &str = "anonymous -";

/// Sub-commands of the ET protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dns { domain: String },
    Location { ip: String },
    Tcp { host: String, port: u16 },
    Unknown,
}

impl Command {
    /// Parse one S2 request line.
    pub fn parse(line: &str) -> Command {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("DNS") => match parts.next() {
                Some(domain) => Command::Dns {
                    domain: domain.to_string(),
                },
                None => Command::Unknown,
            },
            Some("LOCATION") => match parts.next() {
                Some(ip) => Command::Location { ip: ip.to_string() },
                None => Command::Unknown,
            },
            Some("TCP") => match (parts.next(), parts.next().and_then(|p| p.parse().ok())) {
                (Some(host), Some(port)) => Command::Tcp {
                    host: host.to_string(),
                    port,
                },
                _ => Command::Unknown,
            },
            _ => Command::Unknown,
        }
    }
}
