//! Address type for network connections

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Parse `host:port` (or bare `host`, taking `default_port`).
    ///
    /// IPv6 literals may be bracketed (`[::1]:8080`).
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| Error::InvalidAddress(format!("invalid port in {}", s)))?;
                (h, port)
            }
            _ => (s, default_port),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// Get domain if this is a domain address
    pub fn as_domain(&self) -> Option<(&str, u16)> {
        match self {
            Address::Domain(domain, port) => Some((domain, *port)),
            Address::Socket(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
