//! GeoIP - CIDR → country matching for location-based routing.
//!
//! The database is a plain text file (`config-dir/geoip.txt`) of
//! `cidr country` lines, e.g. `1.0.1.0/24 CN`. Used as the local fallback
//! when no relay peer is available for LOCATION queries.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use tracing::{debug, warn};

use crate::config::read_lines;

/// GeoIP matcher over per-country CIDR lists.
#[derive(Clone, Default)]
pub struct GeoIpMatcher {
    /// Country code -> CIDR entries
    countries: HashMap<String, Vec<IpNet>>,
}

impl GeoIpMatcher {
    pub fn new() -> Self {
        Self {
            countries: HashMap::new(),
        }
    }

    /// Load from a text database. A missing file yields an empty matcher;
    /// malformed lines are skipped.
    pub fn load(path: &Path) -> Self {
        let mut matcher = Self::new();
        let lines = match read_lines(path) {
            Ok(lines) => lines,
            Err(_) => {
                debug!("no geoip database at {:?}", path);
                return matcher;
            }
        };
        for line in &lines {
            let mut items = line.split_whitespace();
            let (Some(cidr), Some(country)) = (items.next(), items.next()) else {
                continue;
            };
            match cidr.parse::<IpNet>() {
                Ok(net) => matcher
                    .countries
                    .entry(country.to_uppercase())
                    .or_default()
                    .push(net),
                Err(_) => warn!("geoip: bad cidr {}", cidr),
            }
        }
        debug!(
            "geoip: {} countries loaded from {:?}",
            matcher.countries.len(),
            path
        );
        matcher
    }

    /// Check if an IP address belongs to a country (ISO 3166-1 alpha-2).
    pub fn matches(&self, country_code: &str, ip: IpAddr) -> bool {
        self.countries
            .get(&country_code.to_uppercase())
            .map(|nets| nets.iter().any(|net| net.contains(&ip)))
            .unwrap_or(false)
    }

    /// Get the country code for an IP address.
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        for (country, nets) in &self.countries {
            if nets.iter().any(|net| net.contains(&ip)) {
                return Some(country.clone());
            }
        }
        None
    }

    pub fn is_loaded(&self) -> bool {
        !self.countries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> GeoIpMatcher {
        let mut m = GeoIpMatcher::new();
        m.countries.insert(
            "CN".into(),
            vec!["223.5.5.0/24".parse().unwrap(), "2400:3200::/32".parse().unwrap()],
        );
        m.countries
            .insert("US".into(), vec!["8.8.8.0/24".parse().unwrap()]);
        m
    }

    #[test]
    fn empty_matcher_matches_nothing() {
        let m = GeoIpMatcher::new();
        assert!(!m.is_loaded());
        assert!(!m.matches("CN", "1.1.1.1".parse().unwrap()));
        assert!(m.lookup("1.1.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn matches_v4_and_v6() {
        let m = matcher();
        assert!(m.matches("cn", "223.5.5.5".parse().unwrap()));
        assert!(m.matches("CN", "2400:3200::1".parse().unwrap()));
        assert!(!m.matches("CN", "8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn lookup_finds_country() {
        let m = matcher();
        assert_eq!(m.lookup("8.8.8.8".parse().unwrap()).as_deref(), Some("US"));
        assert!(m.lookup("192.0.2.1".parse().unwrap()).is_none());
    }
}
