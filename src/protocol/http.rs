//! HTTP proxy inbound handler
//!
//! Two modes behind one handler:
//! - Tunnel: CONNECT host:port, confirmed with `200 Connection Established`
//!   after the dial
//! - Forward: plain GET/POST/… with an absolute URI; the request is
//!   rewritten to origin-form, hop-by-hop headers stripped, and prefixed
//!   onto the relayed client stream

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use crate::common::{NetArg, PrefixedStream, Result, Stream};
use crate::error::Error;

use super::{Accepted, InboundProtocol, ReplyMode};

pub const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_403_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
pub const RESPONSE_502_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Connection-scoped headers that must not travel to the origin.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
];

/// HTTP proxy protocol handler
#[derive(Default)]
pub struct HttpProtocol {
    /// Expected `Proxy-Authorization` credentials, when configured
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HttpProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    fn check_auth(&self, auth_header: Option<&str>) -> bool {
        if !self.requires_auth() {
            return true;
        }
        let credentials = format!(
            "{}:{}",
            self.username.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or("")
        );
        let expected = format!("Basic {}", BASE64.encode(credentials));
        auth_header.map(|h| h == expected).unwrap_or(false)
    }
}

/// Parsed HTTP request head
struct HttpRequest {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
    body: Option<BytesMut>,
}

impl HttpRequest {
    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    fn destination(&self) -> Result<NetArg> {
        if self.is_connect() {
            parse_host_port(&self.target, 443)
        } else {
            self.forward_destination()
        }
    }

    fn forward_destination(&self) -> Result<NetArg> {
        // Absolute URI: http://host:port/path
        if let Some(url) = self.target.strip_prefix("http://") {
            let host_part = url.split('/').next().unwrap_or(url);
            return parse_host_port(host_part, 80);
        }
        // Origin-form: /path - need Host header
        if self.target.starts_with('/') {
            if let Some((_, host)) = self.headers.iter().find(|(k, _)| k == "host") {
                return parse_host_port(host, 80);
            }
        }
        Err(Error::Protocol(format!(
            "cannot determine target from: {}",
            self.target
        )))
    }

    /// Path for forwarding (strips the absolute-URI prefix)
    fn forward_path(&self) -> &str {
        if let Some(url) = self.target.strip_prefix("http://") {
            if let Some(pos) = url.find('/') {
                return &url[pos..];
            }
            return "/";
        }
        &self.target
    }

    fn auth_header(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == "proxy-authorization")
            .map(|(_, v)| v.as_str())
    }

    /// Rebuild the request in origin-form without hop-by-hop headers.
    fn to_forward_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.forward_path().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (key, value) in &self.headers {
            if HOP_BY_HOP.contains(&key.as_str()) {
                continue;
            }
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"Connection: close\r\n\r\n");

        if let Some(body) = &self.body {
            buf.extend_from_slice(body);
        }
        buf
    }
}

async fn parse_request(reader: &mut BufReader<Stream>) -> Result<HttpRequest> {
    let (method, target, version) = parse_request_line(reader).await?;
    let (headers, content_length) = parse_headers(reader).await?;
    let body = read_body(reader, content_length).await?;
    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

async fn parse_request_line(reader: &mut BufReader<Stream>) -> Result<(String, String, String)> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let parts: Vec<&str> = line.trim().split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::Protocol("invalid HTTP request line".into()));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}

/// Headers (keys lowercased) plus content-length when present
async fn parse_headers(
    reader: &mut BufReader<Stream>,
) -> Result<(Vec<(String, String)>, Option<usize>)> {
    let mut headers = Vec::new();
    let mut content_length = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            if key == "content-length" {
                content_length = value.parse().ok();
            }
            headers.push((key, value));
        }
    }
    Ok((headers, content_length))
}

async fn read_body(
    reader: &mut BufReader<Stream>,
    content_length: Option<usize>,
) -> Result<Option<BytesMut>> {
    match content_length {
        Some(len) if len > 0 => {
            let mut body = BytesMut::zeroed(len);
            reader.read_exact(&mut body).await?;
            Ok(Some(body))
        }
        _ => Ok(None),
    }
}

/// Parse `host[:port]` into a NetArg
fn parse_host_port(s: &str, default_port: u16) -> Result<NetArg> {
    let addr = crate::common::Address::parse(s, default_port)?;
    Ok(NetArg::from_address(&addr))
}

#[async_trait]
impl InboundProtocol for HttpProtocol {
    async fn accept(&self, stream: Stream) -> Result<Accepted> {
        let mut reader = BufReader::new(stream);
        let request = parse_request(&mut reader).await?;

        debug!(
            "http inbound: {} {} ({})",
            request.method,
            request.target,
            if request.is_connect() {
                "tunnel"
            } else {
                "forward"
            }
        );

        if !self.check_auth(request.auth_header()) {
            return Err(Error::AuthFailed);
        }

        let netarg = request.destination()?;

        // Bytes the client pipelined past the request head must survive the
        // BufReader teardown
        let leftover = BytesMut::from(reader.buffer());
        let mut stream = reader.into_inner();
        if !leftover.is_empty() {
            stream = Box::new(PrefixedStream::new(leftover, stream)) as Stream;
        }

        if request.is_connect() {
            Ok(Accepted {
                netarg,
                stream,
                reply: ReplyMode::HttpTunnel,
            })
        } else {
            // Forward mode: the rewritten request precedes the client bytes
            let forward_data = request.to_forward_bytes();
            let stream = Box::new(PrefixedStream::new(forward_data, stream)) as Stream;
            Ok(Accepted {
                netarg,
                stream,
                reply: ReplyMode::None,
            })
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn accept(request: &str) -> Result<Accepted> {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(request.as_bytes()).await.unwrap();
        HttpProtocol::new().accept(server.into_stream()).await
    }

    #[tokio::test]
    async fn connect_parses_destination() {
        let accepted = accept("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(accepted.netarg.domain.as_deref(), Some("example.com"));
        assert_eq!(accepted.netarg.port, 443);
        assert_eq!(accepted.reply, ReplyMode::HttpTunnel);
    }

    #[tokio::test]
    async fn forward_rewrites_to_origin_form() {
        let accepted = accept(
            "GET http://example.com/index.html HTTP/1.1\r\n\
             Host: example.com\r\n\
             Proxy-Connection: keep-alive\r\n\
             Accept: */*\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(accepted.netarg.domain.as_deref(), Some("example.com"));
        assert_eq!(accepted.netarg.port, 80);
        assert_eq!(accepted.reply, ReplyMode::None);

        // The prefixed stream replays the rewritten request
        let mut stream = accepted.stream;
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]);
        assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(head.contains("host: example.com\r\n"));
        assert!(head.contains("accept: */*\r\n"));
        assert!(!head.to_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn forward_preserves_body() {
        let accepted = accept(
            "POST http://example.com/submit HTTP/1.1\r\n\
             Host: example.com\r\n\
             Content-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();
        let mut stream = accepted.stream;
        let mut buf = vec![0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.ends_with("hello"));
        assert!(text.contains("content-length: 5\r\n"));
    }

    #[tokio::test]
    async fn bad_request_line_is_rejected() {
        assert!(accept("nonsense\r\n\r\n").await.is_err());
    }

    #[tokio::test]
    async fn basic_auth_is_enforced() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let protocol = HttpProtocol {
            username: Some("u".into()),
            password: Some("p".into()),
        };
        assert!(matches!(
            protocol.accept(server.into_stream()).await,
            Err(Error::AuthFailed)
        ));
    }
}
