//! SOCKS5 inbound handler (RFC 1928 subset)
//!
//! NOAUTH method only; CONNECT command only; IPv4/IPv6/domain address
//! types. The success reply is written by the dispatcher once the
//! destination dial succeeded.

use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{NetArg, Result, Stream};
use crate::error::Error;

use super::{Accepted, InboundProtocol, ReplyMode};

pub const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Write a reply frame with an all-zero bind address.
pub async fn write_reply(stream: &mut Stream, rep: u8) -> Result<()> {
    let reply = [SOCKS5_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// SOCKS5 protocol handler
pub struct Socks5Protocol;

#[async_trait]
impl InboundProtocol for Socks5Protocol {
    async fn accept(&self, mut stream: Stream) -> Result<Accepted> {
        // Greeting: version, method list
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported SOCKS version: {}",
                buf[0]
            )));
        }
        let nmethods = buf[1] as usize;
        let mut methods = vec![0u8; nmethods];
        stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_NONE) {
            stream
                .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
                .await?;
            return Err(Error::Protocol("no acceptable auth method".into()));
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

        // Request: VER CMD RSV ATYP
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("invalid SOCKS version in request".into()));
        }

        let cmd = header[1];
        if cmd != CMD_CONNECT {
            write_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!("unsupported command: {}", cmd)));
        }

        let netarg = match header[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                NetArg {
                    ip: Some(Ipv4Addr::from(addr).into()),
                    port,
                    ..Default::default()
                }
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let port = read_port(&mut stream).await?;
                let domain = String::from_utf8_lossy(&domain).to_string();
                NetArg {
                    domain: Some(domain),
                    port,
                    ..Default::default()
                }
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                NetArg {
                    ip: Some(Ipv6Addr::from(addr).into()),
                    port,
                    ..Default::default()
                }
            }
            atyp => {
                write_reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
                return Err(Error::Protocol(format!(
                    "unsupported address type: {}",
                    atyp
                )));
            }
        };

        Ok(Accepted {
            netarg,
            stream,
            reply: ReplyMode::Socks5,
        })
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

async fn read_port(stream: &mut Stream) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}
