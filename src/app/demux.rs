//! Protocol demultiplexer.
//!
//! Reads the first byte of a fresh connection (500 ms budget) and routes:
//! `0x05` is SOCKS5, an ASCII HTTP-method initial is HTTP, anything else is
//! ET. The byte is replayed to the chosen handler through a prefixed
//! stream.

use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::common::{PrefixedStream, Result, Stream};
use crate::error::Error;

/// Handshake sniff budget.
const SNIFF_TIMEOUT: Duration = Duration::from_millis(500);

/// First letters of CONNECT, GET, POST/PUT/PATCH, HEAD, DELETE, OPTIONS,
/// TRACE.
const HTTP_METHOD_INITIALS: &[u8] = b"CGPHDOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Socks5,
    Http,
    Et,
}

/// Classify a fresh connection by its first byte.
///
/// A peer that stays silent past the budget is cut off with `Timeout`.
pub async fn sniff(mut stream: Stream) -> Result<(Sniffed, Stream)> {
    let first = match tokio::time::timeout(SNIFF_TIMEOUT, stream.read_u8()).await {
        Ok(Ok(byte)) => byte,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed)
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::Timeout),
    };

    let sniffed = if first == 0x05 {
        Sniffed::Socks5
    } else if HTTP_METHOD_INITIALS.contains(&first) {
        Sniffed::Http
    } else {
        Sniffed::Et
    };

    let stream = Box::new(PrefixedStream::new(&[first][..], stream)) as Stream;
    Ok((sniffed, stream))
}
