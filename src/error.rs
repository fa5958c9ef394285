//! Error types for Eagletun

use thiserror::Error;

/// Main error type for Eagletun
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Rate limited: user {0} is over budget")]
    RateLimited(String),

    #[error("Ad hosts found: {0}")]
    HostsBlocked(String),

    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    #[error("Invalid DNS reply: {0}")]
    InvalidReply(String),

    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    #[error("No relayer configured")]
    NoRelayer,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Line exceeds {0} bytes")]
    OversizedLine(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid proxy-status")]
    InvalidProxyStatus,

    /// Not an error: the command line asked for something (help, version)
    /// that terminates the process before the server starts.
    #[error("early exit")]
    EarlyExit,
}

impl Error {
    /// Stable label used by the per-kind error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::Protocol(_) => "protocol",
            Error::InvalidAddress(_) => "invalid_address",
            Error::AuthFailed => "auth_failed",
            Error::RateLimited(_) => "rate_limited",
            Error::HostsBlocked(_) => "hosts_blocked",
            Error::Resolve(_) => "resolve",
            Error::InvalidReply(_) => "invalid_reply",
            Error::VersionMismatch(_) => "version_mismatch",
            Error::NoRelayer => "no_relayer",
            Error::ConnectionClosed => "connection_closed",
            Error::Timeout => "timeout",
            Error::OversizedLine(_) => "oversized_line",
            Error::Cancelled => "cancelled",
            Error::InvalidProxyStatus => "invalid_proxy_status",
            Error::EarlyExit => "early_exit",
        }
    }
}

/// Result type alias for Eagletun
pub type Result<T> = std::result::Result<T, Error>;
