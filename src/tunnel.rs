//! TunnelStream - the obfuscated byte channel the ET protocol rides on.
//!
//! Wraps any [`Stream`]: every read decrypts, every write encrypts with the
//! per-deployment XOR key. On top of the transparent [`XorStream`] it offers
//! the framed operations the ET state machine needs: bounded text lines and
//! exact-length reads, each guarded by a per-call timeout.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::common::Stream;
use crate::error::{Error, Result};
use crate::obfs;

/// Upper bound for one protocol line, terminator included.
pub const MAX_LINE: usize = 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transparent XOR layer over a Stream.
///
/// Reads decrypt in place after the inner read; writes encrypt into a
/// scratch buffer first. XOR is stateless per byte, so a short inner write
/// of n encrypted bytes consumes exactly n plaintext bytes.
pub struct XorStream {
    inner: Stream,
    key: u8,
}

impl XorStream {
    pub fn new(inner: Stream, key: u8) -> Self {
        Self { inner, key }
    }
}

impl AsyncRead for XorStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut *self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let key = self.key;
            obfs::decrypt(&mut buf.filled_mut()[before..], key);
        }
        result
    }
}

impl AsyncWrite for XorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.key == 0 {
            return Pin::new(&mut *self.inner).poll_write(cx, buf);
        }
        let mut scratch = buf.to_vec();
        obfs::encrypt(&mut scratch, self.key);
        Pin::new(&mut *self.inner).poll_write(cx, &scratch)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Framed view of an obfuscated connection.
pub struct TunnelStream {
    io: XorStream,
    closed: bool,
}

impl TunnelStream {
    pub fn new(inner: Stream, key: u8) -> Self {
        Self {
            io: XorStream::new(inner, key),
            closed: false,
        }
    }

    /// Read exactly `n` bytes, decrypting. Early peer close is
    /// `ConnectionClosed`; stalls longer than the read timeout fail.
    pub async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        match tokio::time::timeout(READ_TIMEOUT, self.io.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::ConnectionClosed)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Encrypt and write the whole buffer.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match tokio::time::timeout(WRITE_TIMEOUT, async {
            self.io.write_all(bytes).await?;
            self.io.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Read one `\n`-terminated line, trimming `\r\n`.
    ///
    /// Reads byte-at-a-time so no bytes past the terminator are consumed;
    /// the connection can switch to raw relaying right after a line.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::with_capacity(64);
        loop {
            let byte = match tokio::time::timeout(READ_TIMEOUT, self.io.read_u8()).await {
                Ok(Ok(b)) => b,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::ConnectionClosed)
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(Error::Timeout),
            };
            if byte == b'\n' {
                break;
            }
            if line.len() >= MAX_LINE {
                return Err(Error::OversizedLine(MAX_LINE));
            }
            line.push(byte);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| Error::Protocol("line is not valid UTF-8".into()))
    }

    /// Append `\n` and write.
    pub async fn write_line(&mut self, s: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(s.len() + 1);
        buf.extend_from_slice(s.as_bytes());
        buf.push(b'\n');
        self.write_all(&buf).await
    }

    /// Idempotent shutdown of the write half.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.shutdown().await.map_err(Error::from)
    }

    /// Unwrap into a transparent XOR stream for raw relaying.
    pub fn into_stream(self) -> Stream {
        Box::new(self.io)
    }
}
