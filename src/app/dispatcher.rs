//! Dispatcher - Core Execution Flow
//!
//! One accepted connection travels:
//!
//! ```text
//! sniff() → protocol handler → DnsResolver.resolve()
//!        → dial (direct, or ET TCP through the relayer)
//!        → protocol success reply → bidirectional relay
//! ```
//!
//! The dispatcher owns the route decision plumbing; protocol handlers only
//! parse and reply. Handlers for protocols the config disables refuse the
//! connection outright.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::common::{Result, Stream};
use crate::dns::{DnsResolver, Route};
use crate::error::Error;
use crate::protocol::et::{EtClient, EtServer};
use crate::protocol::{self, Accepted, HttpProtocol, InboundProtocol, Socks5Protocol};
use crate::relay;
use crate::tunnel::TunnelStream;

use super::demux::{self, Sniffed};
use super::metrics;

pub struct Dispatcher {
    resolver: Arc<DnsResolver>,
    et_client: Option<Arc<EtClient>>,
    et_server: EtServer,
    socks5: Socks5Protocol,
    http: HttpProtocol,
    data_key: u8,
    enable_socks: bool,
    enable_http: bool,
    enable_et: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<DnsResolver>,
        et_client: Option<Arc<EtClient>>,
        et_server: EtServer,
        data_key: u8,
        enable_socks: bool,
        enable_http: bool,
        enable_et: bool,
    ) -> Self {
        Self {
            resolver,
            et_client,
            et_server,
            socks5: Socks5Protocol,
            http: HttpProtocol::new(),
            data_key,
            enable_socks,
            enable_http,
            enable_et,
        }
    }

    /// Handle one accepted connection to completion.
    pub async fn handle(&self, stream: Stream) -> Result<()> {
        let (sniffed, stream) = demux::sniff(stream).await?;
        match sniffed {
            Sniffed::Socks5 => {
                if !self.enable_socks {
                    return Err(Error::Protocol("socks disabled".into()));
                }
                self.handle_proxy(&self.socks5, stream).await
            }
            // A first byte that looks like an HTTP method belongs to the
            // HTTP handler only while HTTP is on; otherwise it may be an
            // obfuscated ET banner
            Sniffed::Http if self.enable_http => self.handle_proxy(&self.http, stream).await,
            Sniffed::Http | Sniffed::Et => {
                if !self.enable_et {
                    return Err(Error::Protocol("et disabled".into()));
                }
                self.et_server
                    .serve(TunnelStream::new(stream, self.data_key))
                    .await
            }
        }
    }

    /// SOCKS5 / HTTP flow: parse, resolve, dial, confirm, relay.
    async fn handle_proxy(&self, handler: &dyn InboundProtocol, stream: Stream) -> Result<()> {
        let start = Instant::now();
        let Accepted {
            mut netarg,
            mut stream,
            reply,
        } = handler.accept(stream).await?;

        if let Some(domain) = &netarg.domain {
            netarg.domain_type = self.resolver.classify(domain);
        }

        let target = match self.connect(&mut netarg).await {
            Ok(target) => target,
            Err(err) => {
                debug!("{} to {} refused: {}", handler.name(), netarg.display(), err);
                protocol::write_refusal(reply, &mut stream, &err).await;
                return Err(err);
            }
        };
        protocol::write_success(reply, &mut stream).await?;

        info!("{}: {} connected", handler.name(), netarg.display());
        let (up, down) = relay::relay(stream, target, None).await;
        info!(
            "{}: {} closed (↑{} ↓{} {:?})",
            handler.name(),
            netarg.display(),
            relay::format_bytes(up),
            relay::format_bytes(down),
            start.elapsed()
        );
        Ok(())
    }

    /// Resolve the destination and obtain a stream to it, directly or
    /// through the relay peer.
    async fn connect(&self, netarg: &mut crate::common::NetArg) -> Result<Stream> {
        let route = self.resolver.resolve(netarg).await?;
        let dest = netarg
            .dest()
            .ok_or_else(|| Error::InvalidAddress(netarg.display()))?;
        match route {
            Route::Direct => relay::dial(dest).await,
            Route::Proxied => {
                let client = self.et_client.as_ref().ok_or(Error::NoRelayer)?;
                client.open_tcp(dest.ip(), dest.port()).await
            }
        }
    }
}

/// Log and count one session's outcome.
pub fn record_outcome(result: &Result<()>) {
    if let Err(err) = result {
        metrics::record_error(err);
        match err {
            // Routine session-level noise
            Error::ConnectionClosed | Error::Timeout | Error::Cancelled => {
                debug!("session ended: {}", err)
            }
            _ => warn!("session error: {}", err),
        }
    }
}
