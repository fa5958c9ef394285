//! Service - accept loop, admission cap and lifecycle.
//!
//! Binds the configured endpoint, spawns one task per accepted connection
//! (capped by a semaphore), runs the user-counter ticker, and on shutdown
//! stops accepting and waits up to five seconds for active sessions to
//! drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use crate::common::IntoStream;
use crate::config::Config;
use crate::dns::{DnsResolver, RemoteQuery, SystemLookup};
use crate::error::Result;
use crate::geoip::GeoIpMatcher;
use crate::hosts::HostsOverlay;
use crate::location::LocationClient;
use crate::protocol::et::{EtClient, EtServer};
use crate::user::{User, UserRegistry};

use super::dispatcher::{record_outcome, Dispatcher};
use super::metrics;

/// Global cap on concurrent sessions.
pub const MAX_SESSIONS: usize = 1024;

/// How long shutdown waits for active sessions.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Service {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    users: Arc<UserRegistry>,
    et_client: Option<Arc<EtClient>>,
    shutdown_tx: broadcast::Sender<()>,
    permits: Arc<Semaphore>,
}

impl Service {
    /// Assemble every component from the validated config.
    pub fn from_config(config: Config) -> Result<Self> {
        let mut users = if config.user_check {
            UserRegistry::from_lines(&config.load_user_lines())?
        } else {
            UserRegistry::new()
        };
        if let Some((id, password)) = &config.local_user {
            if users.get(id).is_none() {
                users.insert(User::new(id.clone(), password, 0, 0));
            }
        }
        let users = Arc::new(users);

        let hosts = HostsOverlay::load_dir(&config.hosts_dir());
        let direct_domains = config.load_domain_list(&config.whitelist_path());
        let proxy_domains = config.load_domain_list(&config.proxylist_path());
        let geoip = GeoIpMatcher::load(&config.geoip_path());

        let et_client = config.relayer.as_ref().map(|relayer| {
            Arc::new(EtClient::new(
                relayer.clone(),
                config.data_key,
                config.local_user.clone(),
            ))
        });
        let remote: Option<Arc<dyn RemoteQuery>> = et_client
            .clone()
            .map(|client| client as Arc<dyn RemoteQuery>);

        let resolver = Arc::new(DnsResolver::new(
            config.proxy_status,
            hosts,
            direct_domains,
            proxy_domains,
            config.direct_locations.iter().cloned().collect(),
            Arc::new(SystemLookup),
            remote.clone(),
            LocationClient::new(remote, geoip),
        ));

        let et_server = EtServer::new(resolver.clone(), users.clone(), config.user_check);
        let dispatcher = Arc::new(Dispatcher::new(
            resolver,
            et_client.clone(),
            et_server,
            config.data_key,
            config.enable_socks,
            config.enable_http,
            config.enable_et,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            dispatcher,
            users,
            et_client,
            shutdown_tx,
            permits: Arc::new(Semaphore::new(MAX_SESSIONS)),
        })
    }

    /// The outbound ET client, when a relayer is configured. Used by the
    /// `check` subcommand.
    pub fn et_client(&self) -> Option<Arc<EtClient>> {
        self.et_client.clone()
    }

    /// Request shutdown from anywhere.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind and serve until interrupted.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.run_with(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn run_with(&self, listener: TcpListener) -> Result<()> {
        metrics::init_metrics();
        info!(
            "listening on {} (socks={} http={} et={})",
            listener.local_addr()?,
            self.config.enable_socks,
            self.config.enable_http,
            self.config.enable_et
        );

        tokio::spawn(
            self.users
                .clone()
                .run_ticker(self.shutdown_tx.subscribe()),
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.admit(stream, peer),
                        Err(e) => warn!("accept error: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    self.shutdown();
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        drop(listener);
        self.drain().await;
        Ok(())
    }

    fn admit(&self, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        metrics::SESSIONS_TOTAL.inc();
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            metrics::SESSIONS_OVER_CAP.inc();
            warn!("session cap reached, dropping {}", peer);
            return;
        };
        let _ = stream.set_nodelay(true);

        metrics::SESSIONS_ACTIVE.inc();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            debug!("session from {}", peer);
            let result = dispatcher.handle(stream.into_stream()).await;
            record_outcome(&result);
            metrics::SESSIONS_ACTIVE.dec();
            drop(permit);
        });
    }

    /// Wait for active sessions, bounded by the drain timeout.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.permits.available_permits() < MAX_SESSIONS {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "drain timeout with {} sessions active",
                    MAX_SESSIONS - self.permits.available_permits()
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("all sessions drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Echo origin returning its bound address.
    async fn spawn_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_service(config: Config) -> (Arc<Service>, SocketAddr) {
        let service = Arc::new(Service::from_config(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let runner = service.clone();
        tokio::spawn(async move { runner.run_with(listener).await });
        // Give the accept loop a beat to start
        tokio::time::sleep(Duration::from_millis(20)).await;
        (service, addr)
    }

    fn base_config() -> Config {
        let mut config = Config::default();
        config.enable_socks = true;
        config.enable_http = true;
        config.enable_et = true;
        config.proxy_status = crate::config::ProxyStatus::Smart;
        config.config_dir = std::path::PathBuf::from("/nonexistent-eagletun-test");
        config
    }

    async fn socks5_connect(proxy: SocketAddr, dest: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        match dest.ip() {
            std::net::IpAddr::V4(v4) => request.extend_from_slice(&v4.octets()),
            std::net::IpAddr::V6(_) => unreachable!(),
        }
        request.extend_from_slice(&dest.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00, "socks5 reply code");
        client
    }

    #[tokio::test]
    async fn socks5_connect_end_to_end() {
        let origin = spawn_origin().await;
        let (_service, proxy) = spawn_service(base_config()).await;

        let mut client = socks5_connect(proxy, origin).await;
        client.write_all(b"through the proxy").await.unwrap();
        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the proxy");
    }

    #[tokio::test]
    async fn http_connect_to_ad_blocked_host_is_forbidden() {
        let tmp = std::env::temp_dir().join(format!("eagletun-test-{}", std::process::id()));
        std::fs::create_dir_all(tmp.join("hosts")).unwrap();
        std::fs::write(tmp.join("hosts/ads"), "ads.example ::\n").unwrap();

        let mut config = base_config();
        config.config_dir = tmp.clone();
        let (_service, proxy) = spawn_service(config).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(b"CONNECT ads.example:443 HTTP/1.1\r\nHost: ads.example:443\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));

        let _ = std::fs::remove_dir_all(tmp);
    }

    #[tokio::test]
    async fn relayed_connect_through_two_nodes() {
        let origin = spawn_origin().await;

        // Exit node: accepts ET, dials origins directly
        let mut exit_config = base_config();
        exit_config.enable_socks = false;
        exit_config.enable_http = false;
        let (_exit, exit_addr) = spawn_service(exit_config).await;

        // Edge node: accepts SOCKS5, relays everything through the exit
        let mut edge_config = base_config();
        edge_config.proxy_status = crate::config::ProxyStatus::Enable;
        edge_config.relayer = Some(crate::common::Address::Socket(exit_addr));
        let (_edge, edge_addr) = spawn_service(edge_config).await;

        let mut client = socks5_connect(edge_addr, origin).await;
        client.write_all(b"over the tunnel").await.unwrap();
        let mut buf = [0u8; 15];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the tunnel");
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_and_drains() {
        let origin = spawn_origin().await;
        let service = Arc::new(Service::from_config(base_config()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let runner = service.clone();
        let run_task = tokio::spawn(async move { runner.run_with(listener).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // An active relay should not block shutdown once it finishes
        let mut client = socks5_connect(proxy, origin).await;
        client.write_all(b"x").await.unwrap();

        service.shutdown();
        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(6), run_task)
            .await
            .expect("run did not stop in time")
            .unwrap();
        assert!(result.is_ok());

        // The listener is gone: new connections fail or are reset at once
        match tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(proxy)).await {
            Ok(Ok(mut stream)) => {
                let mut buf = [0u8; 1];
                let outcome = tokio::time::timeout(
                    Duration::from_millis(500),
                    stream.read(&mut buf),
                )
                .await
                .expect("closed socket should answer quickly");
                assert!(matches!(outcome, Ok(0) | Err(_)));
            }
            Ok(Err(_)) | Err(_) => {}
        }
    }
}
