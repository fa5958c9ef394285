//! Split DNS resolution.
//!
//! The resolver owns two single-flight caches (local and remote), the hosts
//! overlay, the domain lists and the routing policy. `resolve` both fills in
//! the destination IP of a [`NetArg`] and answers how the connection should
//! travel: dialed directly, or carried through the relay peer.

mod cache;

pub use cache::{CacheNode, DnsCache};

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::{DomainType, NetArg};
use crate::config::ProxyStatus;
use crate::error::{Error, Result};
use crate::hosts::HostsOverlay;
use crate::location::LocationClient;

/// How a connection travels once its destination is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Dial the origin from this node
    Direct,
    /// Carry the connection through the relay peer
    Proxied,
}

/// Seam to the operating system resolver, mockable in tests.
#[async_trait]
pub trait LocalLookup: Send + Sync {
    async fn lookup(&self, domain: &str) -> Result<IpAddr>;
}

/// OS resolver via tokio's getaddrinfo wrapper. Prefers IPv4 answers.
pub struct SystemLookup;

#[async_trait]
impl LocalLookup for SystemLookup {
    async fn lookup(&self, domain: &str) -> Result<IpAddr> {
        let addrs: Vec<_> = tokio::net::lookup_host((domain, 0u16))
            .await
            .map_err(|e| Error::Resolve(format!("{}: {}", domain, e)))?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| Error::Resolve(format!("{}: no addresses", domain)))
    }
}

/// Seam to the relay peer: the ET DNS and LOCATION sub-commands.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    async fn dns(&self, domain: &str) -> Result<String>;
    async fn location(&self, ip: IpAddr) -> Result<String>;
}

pub struct DnsResolver {
    status: ProxyStatus,
    hosts: HostsOverlay,
    direct_domains: HashSet<String>,
    proxy_domains: HashSet<String>,
    direct_locations: HashSet<String>,
    local_cache: DnsCache,
    remote_cache: DnsCache,
    local: Arc<dyn LocalLookup>,
    remote: Option<Arc<dyn RemoteQuery>>,
    location: LocationClient,
}

impl DnsResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        status: ProxyStatus,
        hosts: HostsOverlay,
        direct_domains: HashSet<String>,
        proxy_domains: HashSet<String>,
        direct_locations: HashSet<String>,
        local: Arc<dyn LocalLookup>,
        remote: Option<Arc<dyn RemoteQuery>>,
        location: LocationClient,
    ) -> Self {
        Self {
            status,
            hosts,
            direct_domains,
            proxy_domains,
            direct_locations,
            local_cache: DnsCache::new(),
            remote_cache: DnsCache::new(),
            local,
            remote,
            location,
        }
    }

    /// Routing class of a domain under smart mode.
    pub fn classify(&self, domain: &str) -> DomainType {
        let domain = domain.to_lowercase();
        if self.direct_domains.contains(&domain) {
            DomainType::Direct
        } else if self.proxy_domains.contains(&domain) {
            DomainType::Proxy
        } else {
            DomainType::Uncertain
        }
    }

    /// Geolocate an IP (relay query, then local database).
    pub async fn locate(&self, ip: IpAddr) -> Option<String> {
        self.location.locate(ip).await
    }

    fn location_wants_proxy(&self, location: Option<&str>) -> bool {
        match location {
            // Unknown location defaults to direct
            None => false,
            Some(country) => !self.direct_locations.contains(&country.to_lowercase()),
        }
    }

    /// Resolve the destination and decide the route.
    ///
    /// Fills `arg.ip` (and `arg.location` on the uncertain path). The hosts
    /// overlay always wins and never issues network DNS.
    pub async fn resolve(&self, arg: &mut NetArg) -> Result<Route> {
        if let Some(ip) = arg.ip {
            return Ok(self.route_for_literal(arg, ip).await);
        }
        let domain = arg
            .domain
            .clone()
            .ok_or_else(|| Error::InvalidAddress("no destination".into()))?;

        if let Some(ip) = self.hosts.lookup(&domain)? {
            arg.ip = Some(ip);
            return Ok(Route::Direct);
        }

        match self.status {
            ProxyStatus::Enable => {
                if self.remote.is_some() {
                    self.resolve_by_remote(arg, &domain).await?;
                    Ok(Route::Proxied)
                } else {
                    // Standalone exit node: nothing to relay through
                    self.resolve_by_local(arg, &domain).await?;
                    Ok(Route::Direct)
                }
            }
            ProxyStatus::Smart => match arg.domain_type {
                DomainType::Direct => {
                    debug!("resolv direct domain: {}", domain);
                    self.resolve_by_local(arg, &domain).await?;
                    Ok(Route::Direct)
                }
                DomainType::Proxy => {
                    debug!("resolv proxy domain: {}", domain);
                    self.resolve_by_remote(arg, &domain).await?;
                    Ok(Route::Proxied)
                }
                DomainType::Uncertain => {
                    debug!("resolv uncertain domain: {}", domain);
                    self.resolve_by_location(arg, &domain).await
                }
            },
        }
    }

    /// Local-path resolution only: hosts overlay, then the local
    /// single-flight cache. This is what the ET DNS sub-command runs.
    pub async fn resolve_local(&self, arg: &mut NetArg) -> Result<()> {
        if arg.ip.is_some() {
            return Ok(());
        }
        let domain = arg
            .domain
            .clone()
            .ok_or_else(|| Error::InvalidAddress("no destination".into()))?;
        if let Some(ip) = self.hosts.lookup(&domain)? {
            arg.ip = Some(ip);
            return Ok(());
        }
        self.resolve_by_local(arg, &domain).await
    }

    /// Smart-mode uncertain path: resolve locally, then let the IP's
    /// location decide. The location call completes before the policy
    /// check; when the policy wants proxying, the local answer is discarded
    /// for the relay's answer.
    async fn resolve_by_location(&self, arg: &mut NetArg, domain: &str) -> Result<Route> {
        self.resolve_by_local(arg, domain).await?;
        let Some(ip) = arg.ip else {
            return Err(Error::Resolve(domain.to_string()));
        };
        arg.location = self.location.locate(ip).await;
        if !self.location_wants_proxy(arg.location.as_deref()) {
            return Ok(Route::Direct);
        }
        if self.remote.is_none() {
            return Ok(Route::Direct);
        }
        let mut remote_arg = NetArg {
            domain: Some(domain.to_string()),
            port: arg.port,
            ..Default::default()
        };
        self.resolve_by_remote(&mut remote_arg, domain).await?;
        arg.ip = remote_arg.ip;
        info!(
            "{} located in {:?}, using relay answer {:?}",
            domain, arg.location, arg.ip
        );
        Ok(Route::Proxied)
    }

    /// Route decision for an IP-literal destination (no DNS involved).
    async fn route_for_literal(&self, arg: &mut NetArg, ip: IpAddr) -> Route {
        match self.status {
            ProxyStatus::Enable => {
                if self.remote.is_some() {
                    Route::Proxied
                } else {
                    Route::Direct
                }
            }
            ProxyStatus::Smart => {
                arg.location = self.location.locate(ip).await;
                if self.remote.is_some() && self.location_wants_proxy(arg.location.as_deref()) {
                    Route::Proxied
                } else {
                    Route::Direct
                }
            }
        }
    }

    async fn resolve_by_local(&self, arg: &mut NetArg, domain: &str) -> Result<()> {
        let (node, created) = self.local_cache.get_or_create(domain);
        if !created {
            arg.ip = Some(node.wait().await?);
            return Ok(());
        }
        match self.local.lookup(domain).await {
            Ok(ip) => {
                node.publish(ip);
                arg.ip = Some(ip);
                Ok(())
            }
            Err(err) => {
                // Surfaced loudly: a locally unresolvable domain is a
                // candidate for the whitelist
                warn!(
                    "fail to resolv dns by local, consider whitelisting {}: {}",
                    domain, err
                );
                node.fail(&err.to_string());
                self.local_cache.remove(domain);
                Err(err)
            }
        }
    }

    async fn resolve_by_remote(&self, arg: &mut NetArg, domain: &str) -> Result<()> {
        let remote = self.remote.as_ref().ok_or(Error::NoRelayer)?;
        let (node, created) = self.remote_cache.get_or_create(domain);
        if !created {
            debug!("wait for remote cachenode: {}", domain);
            arg.ip = Some(node.wait().await?);
            return Ok(());
        }
        let outcome = match remote.dns(domain).await {
            Ok(reply) => match reply.parse::<IpAddr>() {
                Ok(ip) => Ok(ip),
                Err(_) => {
                    warn!("fail to resolv dns by proxy: {} -> {}", domain, reply);
                    Err(Error::InvalidReply(reply))
                }
            },
            Err(err) => Err(err),
        };
        match outcome {
            Ok(ip) => {
                node.publish(ip);
                arg.ip = Some(ip);
                Ok(())
            }
            Err(err) => {
                node.fail(&err.to_string());
                self.remote_cache.remove(domain);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingLookup {
        calls: AtomicUsize,
        open: AtomicBool,
    }

    impl CountingLookup {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                open: AtomicBool::new(false),
            })
        }

        fn release(&self) {
            self.open.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LocalLookup for CountingLookup {
        async fn lookup(&self, _domain: &str) -> Result<IpAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            while !self.open.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            Ok("10.1.2.3".parse().unwrap())
        }
    }

    struct CountingRemote {
        calls: AtomicUsize,
        reply: String,
    }

    #[async_trait]
    impl RemoteQuery for CountingRemote {
        async fn dns(&self, _domain: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
        async fn location(&self, _ip: IpAddr) -> Result<String> {
            Ok("US".to_string())
        }
    }

    fn resolver_with(
        status: ProxyStatus,
        local: Arc<dyn LocalLookup>,
        remote: Option<Arc<dyn RemoteQuery>>,
    ) -> DnsResolver {
        let mut hosts = HostsOverlay::new();
        hosts.add_lines(&[
            "pinned.test 192.0.2.10".to_string(),
            "ads.test ::".to_string(),
        ]);
        let location = LocationClient::new(remote.clone(), crate::geoip::GeoIpMatcher::new());
        DnsResolver::new(
            status,
            hosts,
            ["direct.test".to_string()].into_iter().collect(),
            ["proxied.test".to_string()].into_iter().collect(),
            ["cn".to_string()].into_iter().collect(),
            local,
            remote,
            location,
        )
    }

    fn arg(domain: &str) -> NetArg {
        NetArg {
            domain: Some(domain.to_string()),
            port: 80,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_flight_local_resolution() {
        let lookup = CountingLookup::new();
        let resolver = Arc::new(resolver_with(
            ProxyStatus::Smart,
            lookup.clone(),
            None,
        ));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                let mut e = arg("x.test");
                e.domain_type = DomainType::Direct;
                resolver.resolve(&mut e).await.map(|_| e.ip.unwrap())
            }));
        }

        // Let every task reach the cache before the one lookup completes
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        lookup.release();

        for handle in handles {
            let ip = handle.await.unwrap().unwrap();
            assert_eq!(ip.to_string(), "10.1.2.3");
        }
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hosts_overlay_wins_without_network_dns() {
        let lookup = CountingLookup::new();
        lookup.release();
        let resolver = resolver_with(ProxyStatus::Enable, lookup.clone(), None);

        let mut e = arg("pinned.test");
        let route = resolver.resolve(&mut e).await.unwrap();
        assert_eq!(route, Route::Direct);
        assert_eq!(e.ip.unwrap().to_string(), "192.0.2.10");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn adblocked_domain_is_terminal() {
        let lookup = CountingLookup::new();
        lookup.release();
        let resolver = resolver_with(ProxyStatus::Enable, lookup.clone(), None);

        let mut e = arg("ads.test");
        assert!(matches!(
            resolver.resolve(&mut e).await,
            Err(Error::HostsBlocked(_))
        ));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn enable_mode_uses_remote_path() {
        let lookup = CountingLookup::new();
        lookup.release();
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
            reply: "203.0.113.5".to_string(),
        });
        let resolver = resolver_with(ProxyStatus::Enable, lookup.clone(), Some(remote.clone()));

        let mut e = arg("remote.test");
        let route = resolver.resolve(&mut e).await.unwrap();
        assert_eq!(route, Route::Proxied);
        assert_eq!(e.ip.unwrap().to_string(), "203.0.113.5");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_remote_reply_fails_and_cache_retries() {
        let lookup = CountingLookup::new();
        lookup.release();
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
            reply: "not-an-ip".to_string(),
        });
        let resolver = resolver_with(ProxyStatus::Enable, lookup, Some(remote.clone()));

        let mut e = arg("bad.test");
        assert!(matches!(
            resolver.resolve(&mut e).await,
            Err(Error::InvalidReply(_))
        ));
        // Node was evicted: a second call issues a fresh query
        let mut e = arg("bad.test");
        let _ = resolver.resolve(&mut e).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncertain_foreign_ip_switches_to_remote_answer() {
        let lookup = CountingLookup::new();
        lookup.release();
        // Remote replies with a different IP and locates everything in US;
        // US is not in direct-locations (cn), so the relay answer wins.
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
            reply: "198.51.100.44".to_string(),
        });
        let resolver = resolver_with(ProxyStatus::Smart, lookup.clone(), Some(remote.clone()));

        let mut e = arg("uncertain.test");
        let route = resolver.resolve(&mut e).await.unwrap();
        assert_eq!(route, Route::Proxied);
        assert_eq!(e.location.as_deref(), Some("US"));
        assert_eq!(e.ip.unwrap().to_string(), "198.51.100.44");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn whitelisted_domain_stays_local() {
        let lookup = CountingLookup::new();
        lookup.release();
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
            reply: "198.51.100.44".to_string(),
        });
        let resolver = resolver_with(ProxyStatus::Smart, lookup.clone(), Some(remote.clone()));

        let mut e = arg("direct.test");
        e.domain_type = resolver.classify("direct.test");
        assert_eq!(e.domain_type, DomainType::Direct);
        let route = resolver.resolve(&mut e).await.unwrap();
        assert_eq!(route, Route::Direct);
        assert_eq!(e.ip.unwrap().to_string(), "10.1.2.3");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }
}
