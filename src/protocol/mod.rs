//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - Parse the client's greeting and extract the destination
//! - Confirm or refuse the connection in the client's own dialect
//!
//! Connecting and relaying are the dispatcher's job: handlers return the
//! parsed context and the dispatcher calls back with the verdict once the
//! destination stream exists (or failed). This keeps the reply ordering the
//! protocols require: SOCKS5 and HTTP CONNECT confirm only after the dial.

pub mod socks5;
pub mod http;
pub mod et;

pub use socks5::Socks5Protocol;
pub use http::HttpProtocol;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::common::{NetArg, Result, Stream};
use crate::error::Error;

/// How to confirm success / signal refusal to the client once the
/// destination dial completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// SOCKS5 reply frame
    Socks5,
    /// `HTTP/1.1 200 Connection Established`
    HttpTunnel,
    /// Nothing to say (HTTP forward mode: the rewritten request is already
    /// prefixed onto the client stream)
    None,
}

/// A parsed inbound connection, ready for resolution and dialing.
pub struct Accepted {
    pub netarg: NetArg,
    pub stream: Stream,
    pub reply: ReplyMode,
}

/// Unified inbound handler trait for the greeting-based protocols.
#[async_trait]
pub trait InboundProtocol: Send + Sync {
    /// Consume the protocol greeting and extract the destination.
    async fn accept(&self, stream: Stream) -> Result<Accepted>;

    /// Protocol name for logs
    fn name(&self) -> &'static str;
}

/// Confirm the connection after a successful dial.
pub async fn write_success(mode: ReplyMode, stream: &mut Stream) -> Result<()> {
    match mode {
        ReplyMode::Socks5 => socks5::write_reply(stream, socks5::REP_SUCCESS).await,
        ReplyMode::HttpTunnel => {
            stream.write_all(http::RESPONSE_200_ESTABLISHED).await?;
            stream.flush().await?;
            Ok(())
        }
        ReplyMode::None => Ok(()),
    }
}

/// Refuse the connection in the client's dialect and close.
pub async fn write_refusal(mode: ReplyMode, stream: &mut Stream, err: &Error) {
    let outcome = match mode {
        ReplyMode::Socks5 => {
            let rep = match err {
                Error::HostsBlocked(_) | Error::RateLimited(_) => socks5::REP_NOT_ALLOWED,
                Error::Resolve(_) | Error::InvalidReply(_) | Error::Timeout => {
                    socks5::REP_HOST_UNREACHABLE
                }
                Error::Io(_) | Error::ConnectionClosed => socks5::REP_CONNECTION_REFUSED,
                _ => socks5::REP_GENERAL_FAILURE,
            };
            socks5::write_reply(stream, rep).await
        }
        ReplyMode::HttpTunnel | ReplyMode::None => {
            let response: &[u8] = match err {
                Error::HostsBlocked(_) => http::RESPONSE_403_FORBIDDEN,
                _ => http::RESPONSE_502_BAD_GATEWAY,
            };
            let written = stream.write_all(response).await;
            written.and(stream.flush().await).map_err(Error::from)
        }
    };
    // A peer that is already gone cannot be told anything
    let _ = outcome;
    let _ = stream.shutdown().await;
}
