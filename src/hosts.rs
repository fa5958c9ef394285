//! Hosts overlay - a local, authoritative domain→IP map.
//!
//! Loaded once from every file under `config-dir/hosts/`, then immutable.
//! The sentinel value `::` marks an ad-blocked domain: lookups for it fail
//! with [`Error::HostsBlocked`] and the proxy sends a protocol refusal
//! instead of connecting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::read_lines;
use crate::error::{Error, Result};

/// Sentinel IP marking an ad-blocked domain.
pub const ADBLOCK_SENTINEL: &str = "::";

#[derive(Clone, Copy)]
enum HostEntry {
    Blocked,
    Ip(IpAddr),
}

#[derive(Default)]
pub struct HostsOverlay {
    map: HashMap<String, HostEntry>,
}

impl HostsOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every regular file under `dir`. A missing directory is fine;
    /// unreadable files are skipped with a warning.
    pub fn load_dir(dir: &Path) -> Self {
        let mut overlay = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!("no hosts directory at {:?}", dir);
                return overlay;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match read_lines(&path) {
                Ok(lines) => overlay.add_lines(&lines),
                Err(e) => warn!("skipping hosts file {:?}: {}", path, e),
            }
        }
        info!("hosts overlay: {} entries", overlay.len());
        overlay
    }

    /// Add `domain ip` lines. Entries whose IP is neither the ad-block
    /// sentinel nor a parseable literal are dropped.
    pub fn add_lines(&mut self, lines: &[String]) {
        for line in lines {
            let mut items = line.split_whitespace();
            let (Some(domain), Some(ip)) = (items.next(), items.next()) else {
                continue;
            };
            let entry = if ip == ADBLOCK_SENTINEL {
                HostEntry::Blocked
            } else {
                match ip.parse() {
                    Ok(ip) => HostEntry::Ip(ip),
                    Err(_) => {
                        warn!("hosts entry {} has unparseable ip {}", domain, ip);
                        continue;
                    }
                }
            };
            self.map.insert(domain.to_lowercase(), entry);
        }
    }

    /// Exact-match lookup, case-insensitive.
    ///
    /// `Ok(Some(ip))` for a mapped domain, `Ok(None)` for a miss, and
    /// `Err(HostsBlocked)` for the ad-block sentinel.
    pub fn lookup(&self, domain: &str) -> Result<Option<IpAddr>> {
        match self.map.get(&domain.to_lowercase()) {
            None => Ok(None),
            Some(HostEntry::Blocked) => {
                info!("ad hosts found: {}", domain);
                Err(Error::HostsBlocked(domain.to_string()))
            }
            Some(HostEntry::Ip(ip)) => {
                debug!("hosts found: {} {}", domain, ip);
                Ok(Some(*ip))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
