//! Relay - bidirectional byte shuffle between a client and its destination.
//!
//! Copies until either side reaches EOF, half-closes the peer, then lets
//! the opposite loop drain. When a user is attached (ET inbound with
//! user-check), every chunk is admitted against that user's per-second
//! budget before it is forwarded; a rate-limit refusal tears the relay
//! down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::app::metrics::{TRAFFIC_BYTES_DOWN, TRAFFIC_BYTES_UP};
use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;
use crate::user::{Direction, User};

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Dial timeout
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Dial a resolved destination.
pub async fn dial(dest: SocketAddr) -> Result<Stream> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(dest))
        .await
        .map_err(|_| Error::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream.into_stream())
}

/// Dial an address that may still be a name (the relayer endpoint).
pub async fn dial_address(addr: &Address) -> Result<Stream> {
    let stream = match addr {
        Address::Socket(dest) => {
            tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(dest))
                .await
                .map_err(|_| Error::Timeout)??
        }
        Address::Domain(domain, port) => {
            tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((domain.as_str(), *port)))
                .await
                .map_err(|_| Error::Timeout)??
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream.into_stream())
}

/// Copy bytes both ways until both directions are done. Returns
/// (client→target, target→client) byte counts.
pub async fn relay(client: Stream, target: Stream, user: Option<Arc<User>>) -> (u64, u64) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let up_user = user.clone();
    let upload = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if let Some(user) = &up_user {
                if let Err(e) = user.admit(Direction::Tx, n as u64) {
                    debug!("upload stopped: {}", e);
                    crate::app::metrics::record_error(&e);
                    break;
                }
            }
            if target_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if target_write.flush().await.is_err() {
                break;
            }
            total += n as u64;
            TRAFFIC_BYTES_UP.inc_by(n as u64);
        }
        let _ = target_write.shutdown().await;
        total
    };

    let down_user = user;
    let download = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match target_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if let Some(user) = &down_user {
                if let Err(e) = user.admit(Direction::Rx, n as u64) {
                    debug!("download stopped: {}", e);
                    crate::app::metrics::record_error(&e);
                    break;
                }
            }
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if client_write.flush().await.is_err() {
                break;
            }
            total += n as u64;
            TRAFFIC_BYTES_DOWN.inc_by(n as u64);
        }
        let _ = client_write.shutdown().await;
        total
    };

    tokio::join!(upload, download)
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_cross_unchanged() {
        let (client_near, client_far) = tokio::io::duplex(4096);
        let (target_near, target_far) = tokio::io::duplex(4096);

        let relay_task = tokio::spawn(relay(
            client_far.into_stream(),
            target_near.into_stream(),
            None,
        ));

        let (mut client, mut origin) = (client_near, target_far);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(origin);
        let (up, down) = relay_task.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    #[tokio::test]
    async fn rate_limited_user_stops_the_relay() {
        let user = Arc::new(User::new("tiny", "pw", 8, 0));
        let (client_near, client_far) = tokio::io::duplex(4096);
        let (target_near, target_far) = tokio::io::duplex(4096);

        let relay_task = tokio::spawn(relay(
            client_far.into_stream(),
            target_near.into_stream(),
            Some(user),
        ));

        let mut client = client_near;
        // First chunk fits the budget, the second is refused
        client.write_all(b"12345678").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"overflow").await.unwrap();

        let mut origin = target_far;
        let mut buf = vec![0u8; 64];
        let n = origin.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"12345678");
        // Relay shut the target write half down after the refusal
        let n = origin.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        drop(client);
        drop(origin);
        let (up, _down) = relay_task.await.unwrap();
        assert_eq!(up, 8);
    }

    #[test]
    fn format_bytes_scales() {
        assert_eq!(format_bytes(500), "500B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00MB");
    }
}
