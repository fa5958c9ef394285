//! Outbound ET client - the local node's channel to its relay peer.
//!
//! Each request opens a fresh session: dial, banner, auth, one command.
//! DNS and LOCATION queries are one line each; a confirmed TCP command
//! turns the session into the destination stream for relaying.

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, Result, Stream};
use crate::dns::RemoteQuery;
use crate::error::Error;
use crate::relay;
use crate::tunnel::TunnelStream;
use crate::user::hash_password;

use super::{ANONYMOUS_AUTH, BANNER, REPLY_AUTH_FAILED, REPLY_OK, REPLY_VERSION_MISMATCH};

pub struct EtClient {
    relay: Address,
    key: u8,
    auth_line: String,
}

impl EtClient {
    pub fn new(relay: Address, key: u8, local_user: Option<(String, String)>) -> Self {
        let auth_line = match local_user {
            Some((id, password)) => format!("{} {}", id, hash_password(&password)),
            None => ANONYMOUS_AUTH.to_string(),
        };
        Self {
            relay,
            key,
            auth_line,
        }
    }

    /// Dial the relayer and run handshake + auth.
    async fn session(&self) -> Result<TunnelStream> {
        let stream = relay::dial_address(&self.relay).await?;
        let mut tunnel = TunnelStream::new(stream, self.key);
        tunnel.write_line(BANNER).await?;
        tunnel.write_line(&self.auth_line).await?;
        match tunnel.read_line().await?.as_str() {
            REPLY_OK => Ok(tunnel),
            REPLY_AUTH_FAILED => Err(Error::AuthFailed),
            REPLY_VERSION_MISMATCH => Err(Error::VersionMismatch(BANNER.to_string())),
            other => Err(Error::Protocol(format!("unexpected reply: {}", other))),
        }
    }

    /// One-line query: send `req`, return the reply line, mapping the
    /// failure token to `err`.
    async fn query(&self, req: &str, err: fn(String) -> Error) -> Result<String> {
        let mut tunnel = self.session().await?;
        tunnel.write_line(req).await?;
        let reply = tunnel.read_line().await?;
        let _ = tunnel.close().await;
        if reply == super::REPLY_FAIL || reply.is_empty() {
            return Err(err(req.to_string()));
        }
        Ok(reply)
    }

    /// Open a relayed TCP connection through the peer. The returned stream
    /// is the obfuscated byte channel to the destination.
    pub async fn open_tcp(&self, ip: IpAddr, port: u16) -> Result<Stream> {
        let mut tunnel = self.session().await?;
        tunnel.write_line(&format!("TCP {} {}", ip, port)).await?;
        match tunnel.read_line().await?.as_str() {
            REPLY_OK => {
                debug!("relay accepted tcp {}:{}", ip, port);
                Ok(tunnel.into_stream())
            }
            other => Err(Error::Protocol(format!(
                "relay refused tcp {}:{}: {}",
                ip, port, other
            ))),
        }
    }

    /// Probe the relayer: dial + handshake + auth only.
    pub async fn probe(&self) -> Result<()> {
        let mut tunnel = self.session().await?;
        tunnel.close().await
    }
}

#[async_trait]
impl RemoteQuery for EtClient {
    async fn dns(&self, domain: &str) -> Result<String> {
        self.query(&format!("DNS {}", domain), Error::Resolve).await
    }

    async fn location(&self, ip: IpAddr) -> Result<String> {
        self.query(&format!("LOCATION {}", ip), |req| {
            Error::Protocol(format!("location query failed: {}", req))
        })
        .await
    }
}
