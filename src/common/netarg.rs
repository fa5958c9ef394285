//! NetArg - the connection context handed from protocol handlers to the
//! resolver and the relay.
//!
//! A handler fills in the destination (domain or IP literal); the resolver
//! fills in the resolved IP, the observed location and the routing class.

use std::net::IpAddr;

use super::Address;

/// Domain routing class in smart mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainType {
    /// Listed in the whitelist: resolve and dial locally
    Direct,
    /// Listed in the proxy list: resolve and dial through the relayer
    Proxy,
    /// Not listed: resolve locally, then decide by IP location
    #[default]
    Uncertain,
}

/// Connection context for one proxied request
#[derive(Debug, Clone, Default)]
pub struct NetArg {
    /// Destination domain, when the client sent one
    pub domain: Option<String>,
    /// Destination IP, once known
    pub ip: Option<IpAddr>,
    /// Destination port
    pub port: u16,
    /// Country code of `ip`, when a location lookup ran
    pub location: Option<String>,
    /// Routing class of `domain`
    pub domain_type: DomainType,
}

impl NetArg {
    pub fn from_address(addr: &Address) -> Self {
        match addr {
            Address::Socket(sa) => NetArg {
                ip: Some(sa.ip()),
                port: sa.port(),
                ..Default::default()
            },
            Address::Domain(domain, port) => NetArg {
                domain: Some(domain.clone()),
                port: *port,
                ..Default::default()
            },
        }
    }

    /// The resolved dial target. Only valid after resolution succeeded.
    pub fn dest(&self) -> Option<std::net::SocketAddr> {
        self.ip.map(|ip| std::net::SocketAddr::new(ip, self.port))
    }

    /// Human-readable destination for log lines.
    pub fn display(&self) -> String {
        match (&self.domain, &self.ip) {
            (Some(d), _) => format!("{}:{}", d, self.port),
            (None, Some(ip)) => format!("{}:{}", ip, self.port),
            (None, None) => format!("?:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_domain_address() {
        let arg = NetArg::from_address(&Address::domain("example.com", 443));
        assert_eq!(arg.domain.as_deref(), Some("example.com"));
        assert_eq!(arg.port, 443);
        assert!(arg.ip.is_none());
        assert_eq!(arg.domain_type, DomainType::Uncertain);
    }

    #[test]
    fn from_socket_address() {
        let arg = NetArg::from_address(&Address::Socket("1.2.3.4:80".parse().unwrap()));
        assert_eq!(arg.ip.unwrap().to_string(), "1.2.3.4");
        assert!(arg.dest().is_some());
    }
}
