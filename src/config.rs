//! Configuration module for Eagletun
//!
//! The main config is a text file of `key = value` lines; `#` starts a
//! comment. Auxiliary files (user table, hosts overlay, domain lists, the
//! geoip database) live under `config-dir` and load leniently: a missing
//! auxiliary file is fine, a missing main config file is fatal.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::common::Address;
use crate::error::{Error, Result};
use crate::obfs;

/// Routing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyStatus {
    /// Everything travels through the relayer
    #[default]
    Enable,
    /// Domain lists and IP location pick direct vs. proxied per request
    Smart,
}

impl ProxyStatus {
    fn parse(value: &str) -> Self {
        match value {
            "enable" => ProxyStatus::Enable,
            "smart" => ProxyStatus::Smart,
            other => {
                warn!("unknown proxy-status {:?}, using enable", other);
                ProxyStatus::Enable
            }
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Enable => "enable",
            ProxyStatus::Smart => "smart",
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Local bind endpoint
    pub listen: SocketAddr,
    /// Remote ET peer
    pub relayer: Option<Address>,
    /// Local credentials for outbound ET sessions
    pub local_user: Option<(String, String)>,
    /// Require auth on inbound ET
    pub user_check: bool,
    pub enable_socks: bool,
    pub enable_http: bool,
    pub enable_et: bool,
    /// Obfuscation key
    pub data_key: u8,
    pub proxy_status: ProxyStatus,
    /// Directory holding users.list, hosts/, domain lists and geoip.txt
    pub config_dir: PathBuf,
    /// Smart mode: countries whose IPs are dialed direct
    pub direct_locations: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".parse().unwrap(),
            relayer: None,
            local_user: None,
            user_check: false,
            enable_socks: false,
            enable_http: false,
            enable_et: false,
            data_key: obfs::DEFAULT_KEY,
            proxy_status: ProxyStatus::Enable,
            config_dir: PathBuf::from("."),
            direct_locations: vec!["cn".to_string()],
        }
    }
}

impl Config {
    /// Load the main config file. Unlike the auxiliary files this one must
    /// exist and parse.
    pub fn load(path: &Path) -> Result<Self> {
        let lines = read_lines(path)
            .map_err(|e| Error::Config(format!("failed to read {:?}: {}", path, e)))?;
        let mut config = Self::parse_lines(&lines)?;
        // config-dir defaults next to the config file
        if config.config_dir == Path::new(".") {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    config.config_dir = parent.to_path_buf();
                }
            }
        }
        Ok(config)
    }

    /// Parse config text (already comment-stripped and lowercased lines).
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<String> = text
            .lines()
            .filter_map(|line| {
                let line = clean_line(line);
                (!line.is_empty()).then_some(line)
            })
            .collect();
        Self::parse_lines(&lines)
    }

    fn parse_lines(lines: &[String]) -> Result<Self> {
        let mut config = Config::default();
        for (key, value) in key_values(lines) {
            match key.as_str() {
                "listen" => {
                    let addr = Address::parse(&value, 8080)?;
                    config.listen = match addr {
                        Address::Socket(sa) => sa,
                        Address::Domain(d, _) => {
                            return Err(Error::Config(format!("listen must be an ip: {}", d)))
                        }
                    };
                }
                "relayer" => config.relayer = Some(Address::parse(&value, 8080)?),
                "user" => {
                    let (id, password) = value
                        .split_once(':')
                        .ok_or_else(|| Error::Config(format!("bad user value: {}", value)))?;
                    config.local_user = Some((id.to_string(), password.to_string()));
                }
                "user-check" => config.user_check = value == "on",
                "socks" => config.enable_socks = value == "on",
                "http" => config.enable_http = value == "on",
                "et" => config.enable_et = value == "on",
                "data-key" => {
                    config.data_key = u8::from_str_radix(&value, 16)
                        .map_err(|_| Error::Config(format!("bad data-key: {}", value)))?;
                }
                "proxy-status" => config.proxy_status = ProxyStatus::parse(&value),
                "config-dir" => config.config_dir = PathBuf::from(&value),
                "direct-locations" => {
                    config.direct_locations = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                other => warn!("unknown config key: {}", other),
            }
        }
        Ok(config)
    }

    /// Render the recognized keys back to config text. `parse(serialize())`
    /// reproduces the same config.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        };
        push("listen", &self.listen.to_string());
        if let Some(relayer) = &self.relayer {
            push("relayer", &relayer.to_string());
        }
        if let Some((id, password)) = &self.local_user {
            push("user", &format!("{}:{}", id, password));
        }
        push("user-check", on_off(self.user_check));
        push("socks", on_off(self.enable_socks));
        push("http", on_off(self.enable_http));
        push("et", on_off(self.enable_et));
        push("data-key", &format!("{:02x}", self.data_key));
        push("proxy-status", self.proxy_status.as_str());
        push("config-dir", &self.config_dir.display().to_string());
        push("direct-locations", &self.direct_locations.join(","));
        out
    }

    // Auxiliary file locations

    pub fn users_path(&self) -> PathBuf {
        self.config_dir.join("users.list")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.config_dir.join("hosts")
    }

    pub fn whitelist_path(&self) -> PathBuf {
        self.config_dir.join("whitelist_domain.txt")
    }

    pub fn proxylist_path(&self) -> PathBuf {
        self.config_dir.join("proxylist_domain.txt")
    }

    pub fn geoip_path(&self) -> PathBuf {
        self.config_dir.join("geoip.txt")
    }

    /// `users.list` lines, case preserved (passwords live here). Missing
    /// file → empty.
    pub fn load_user_lines(&self) -> Vec<String> {
        let Ok(text) = std::fs::read_to_string(self.users_path()) else {
            return Vec::new();
        };
        text.lines()
            .map(|line| {
                let line = line.split('#').next().unwrap_or("");
                line.trim().to_string()
            })
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// One-domain-per-line list. Missing file → empty.
    pub fn load_domain_list(&self, path: &Path) -> HashSet<String> {
        match read_lines(path) {
            Ok(lines) => lines.into_iter().collect(),
            Err(_) => HashSet::new(),
        }
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Strip the comment, trim, normalize tabs, lowercase.
fn clean_line(line: &str) -> String {
    let line = line.split('#').next().unwrap_or("");
    line.trim().replace('\t', " ").to_lowercase()
}

/// Read a text file into cleaned lines.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let line = clean_line(line);
            (!line.is_empty()).then_some(line)
        })
        .collect())
}

/// Split `key = value` lines, preserving `=` inside values.
fn key_values(lines: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in lines {
        if let Some((key, value)) = line.split_once('=') {
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# eagletun config
listen = 0.0.0.0:9090
relayer = relay.example:8080
user = alice:opensesame
user-check = on
socks = on
http = on
et = on
data-key = 7b
proxy-status = smart
direct-locations = cn,jp
";

    #[test]
    fn parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.listen.port(), 9090);
        assert_eq!(
            config.relayer,
            Some(Address::Domain("relay.example".into(), 8080))
        );
        assert_eq!(
            config.local_user,
            Some(("alice".to_string(), "opensesame".to_string()))
        );
        assert!(config.user_check);
        assert!(config.enable_socks && config.enable_http && config.enable_et);
        assert_eq!(config.data_key, 0x7b);
        assert_eq!(config.proxy_status, ProxyStatus::Smart);
        assert_eq!(config.direct_locations, vec!["cn", "jp"]);
    }

    #[test]
    fn defaults_apply() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.listen.to_string(), "0.0.0.0:8080");
        assert!(config.relayer.is_none());
        assert_eq!(config.data_key, 0x22);
        assert_eq!(config.proxy_status, ProxyStatus::Enable);
        assert!(!config.enable_socks);
    }

    #[test]
    fn relayer_port_defaults_to_8080() {
        let config = Config::parse("relayer = relay.example").unwrap();
        assert_eq!(config.relayer.unwrap().port(), 8080);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = Config::parse("# comment\n\nsocks = on # trailing\n").unwrap();
        assert!(config.enable_socks);
    }

    #[test]
    fn bad_data_key_is_fatal() {
        assert!(matches!(
            Config::parse("data-key = zz"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn round_trip_is_idempotent() {
        let first = Config::parse(SAMPLE).unwrap();
        let second = Config::parse(&first.serialize()).unwrap();
        assert_eq!(first.serialize(), second.serialize());
    }

    #[test]
    fn values_keep_embedded_equals() {
        let pairs = key_values(&["key = a=b=c".to_string()]);
        assert_eq!(pairs, vec![("key".to_string(), "a=b=c".to_string())]);
    }
}
