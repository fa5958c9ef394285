//! LocationClient - IP → country classification.
//!
//! Prefers asking the relay peer over the ET LOCATION sub-command; falls
//! back to the local GeoIP database. Lookup errors are not fatal: an
//! unknown location resolves as `None` and the caller treats the
//! destination as direct.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::dns::RemoteQuery;
use crate::geoip::GeoIpMatcher;

pub struct LocationClient {
    remote: Option<Arc<dyn RemoteQuery>>,
    geoip: GeoIpMatcher,
}

impl LocationClient {
    pub fn new(remote: Option<Arc<dyn RemoteQuery>>, geoip: GeoIpMatcher) -> Self {
        Self { remote, geoip }
    }

    /// Local-database-only client (used on the relay server side).
    pub fn local_only(geoip: GeoIpMatcher) -> Self {
        Self {
            remote: None,
            geoip,
        }
    }

    /// Country code of `ip`, or `None` when neither source knows.
    pub async fn locate(&self, ip: IpAddr) -> Option<String> {
        if let Some(remote) = &self.remote {
            match remote.location(ip).await {
                Ok(country) if !country.is_empty() => return Some(country),
                Ok(_) => {}
                Err(e) => debug!("relay location query failed for {}: {}", ip, e),
            }
        }
        self.geoip.lookup(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    struct FailingRemote;

    #[async_trait]
    impl RemoteQuery for FailingRemote {
        async fn dns(&self, _domain: &str) -> Result<String> {
            Err(Error::ConnectionClosed)
        }
        async fn location(&self, _ip: IpAddr) -> Result<String> {
            Err(Error::ConnectionClosed)
        }
    }

    struct FixedRemote(&'static str);

    #[async_trait]
    impl RemoteQuery for FixedRemote {
        async fn dns(&self, _domain: &str) -> Result<String> {
            unreachable!()
        }
        async fn location(&self, _ip: IpAddr) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn remote_answer_wins() {
        let client = LocationClient::new(Some(Arc::new(FixedRemote("JP"))), GeoIpMatcher::new());
        let country = client.locate("203.0.113.9".parse().unwrap()).await;
        assert_eq!(country.as_deref(), Some("JP"));
    }

    #[tokio::test]
    async fn remote_error_falls_back_to_geoip() {
        let client = LocationClient::new(Some(Arc::new(FailingRemote)), GeoIpMatcher::new());
        assert!(client.locate("203.0.113.9".parse().unwrap()).await.is_none());
    }
}
