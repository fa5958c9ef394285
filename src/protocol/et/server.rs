//! Inbound ET session state machine.
//!
//! S0 AwaitHandshake → S1 AwaitAuth → S2 AwaitCommand → S3 Relaying.
//! S2 is half-duplex: one command line, one reply, strictly ordered. DNS
//! commands resolve through the local path only; a TCP command that dials
//! successfully replies OK and hands the connection to the relay.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::common::{NetArg, Result};
use crate::dns::DnsResolver;
use crate::error::Error;
use crate::relay;
use crate::tunnel::TunnelStream;
use crate::user::{User, UserRegistry};

use super::{
    Command, BANNER, REPLY_AUTH_FAILED, REPLY_FAIL, REPLY_OK, REPLY_UNKNOWN,
    REPLY_VERSION_MISMATCH,
};

pub struct EtServer {
    resolver: Arc<DnsResolver>,
    users: Arc<UserRegistry>,
    user_check: bool,
}

impl EtServer {
    pub fn new(resolver: Arc<DnsResolver>, users: Arc<UserRegistry>, user_check: bool) -> Self {
        Self {
            resolver,
            users,
            user_check,
        }
    }

    /// Drive one inbound session to completion.
    pub async fn serve(&self, mut tunnel: TunnelStream) -> Result<()> {
        // S0: version banner
        let banner = tunnel.read_line().await?;
        if banner != BANNER {
            tunnel.write_line(REPLY_VERSION_MISMATCH).await?;
            tunnel.close().await?;
            return Err(Error::VersionMismatch(banner));
        }

        // S1: auth line, always present on the wire
        let auth = tunnel.read_line().await?;
        let user = match self.authenticate(&auth) {
            Ok(user) => user,
            Err(err) => {
                tunnel.write_line(REPLY_AUTH_FAILED).await?;
                tunnel.close().await?;
                return Err(err);
            }
        };
        tunnel.write_line(REPLY_OK).await?;

        // S2: command loop
        loop {
            let line = match tunnel.read_line().await {
                Ok(line) => line,
                // Orderly close between commands ends the session
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };
            match Command::parse(&line) {
                Command::Dns { domain } => {
                    let mut arg = NetArg {
                        domain: Some(domain.clone()),
                        ..Default::default()
                    };
                    match self.resolver.resolve_local(&mut arg).await {
                        Ok(()) => match arg.ip {
                            Some(ip) => tunnel.write_line(&ip.to_string()).await?,
                            None => tunnel.write_line(REPLY_FAIL).await?,
                        },
                        Err(err) => {
                            debug!("et dns {} failed: {}", domain, err);
                            tunnel.write_line(REPLY_FAIL).await?;
                        }
                    }
                }
                Command::Location { ip } => {
                    let reply = match ip.parse() {
                        Ok(ip) => self.resolver.locate(ip).await,
                        Err(_) => None,
                    };
                    match reply {
                        Some(country) => tunnel.write_line(&country).await?,
                        None => tunnel.write_line(REPLY_FAIL).await?,
                    }
                }
                Command::Tcp { host, port } => {
                    // S3 or terminal: either way the command loop ends
                    return self.handle_tcp(tunnel, user, &host, port).await;
                }
                Command::Unknown => {
                    debug!("et unknown command: {}", line);
                    tunnel.write_line(REPLY_UNKNOWN).await?;
                }
            }
        }
    }

    fn authenticate(&self, auth_line: &str) -> Result<Option<Arc<User>>> {
        let mut parts = auth_line.split_whitespace();
        let (Some(id), Some(hash)) = (parts.next(), parts.next()) else {
            return Err(Error::AuthFailed);
        };
        if !self.user_check {
            return Ok(None);
        }
        let user = self.users.authenticate(id, hash)?;
        debug!("et session authenticated as {}", user.id);
        Ok(Some(user))
    }

    async fn handle_tcp(
        &self,
        mut tunnel: TunnelStream,
        user: Option<Arc<User>>,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let mut arg = NetArg {
            port,
            ..Default::default()
        };
        match host.parse() {
            Ok(ip) => arg.ip = Some(ip),
            Err(_) => arg.domain = Some(host.to_string()),
        }

        let target = match self.connect(&mut arg).await {
            Ok(target) => target,
            Err(err) => {
                warn!("et tcp {}:{} failed: {}", host, port, err);
                tunnel.write_line(REPLY_FAIL).await?;
                tunnel.close().await?;
                return Err(err);
            }
        };
        tunnel.write_line(REPLY_OK).await?;

        let client = tunnel.into_stream();
        let (up, down) = relay::relay(client, target, user).await;
        info!(
            "et relay closed: {}:{} (↑{} ↓{})",
            host,
            port,
            relay::format_bytes(up),
            relay::format_bytes(down)
        );
        Ok(())
    }

    async fn connect(&self, arg: &mut NetArg) -> Result<crate::common::Stream> {
        self.resolver.resolve_local(arg).await?;
        let dest = arg.dest().ok_or(Error::InvalidAddress(arg.display()))?;
        relay::dial(dest).await
    }
}
