//! Raw TCP transport
//!
//! Dials the candidate addresses in order and adapts the winning socket into
//! transport halves.

use super::{BoxRx, BoxTx, Stream, TransportRx, TransportTx};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connection timeout per candidate address
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read size per receive call
const READ_BUF_SIZE: usize = 16 * 1024;

/// Connect to the first reachable address, in list order.
pub async fn connect(addrs: &[SocketAddr]) -> Result<Stream> {
    if addrs.is_empty() {
        return Err(Error::connection("No candidate addresses"));
    }

    let mut last_err = None;
    for addr in addrs {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                configure_socket(&stream);
                debug!("TCP connected to {}", addr);
                let (read_half, write_half) = stream.into_split();
                return Ok(Stream::new(
                    Box::new(TcpTx {
                        inner: Some(write_half),
                    }) as BoxTx,
                    Box::new(TcpRx { inner: read_half }) as BoxRx,
                ));
            }
            Ok(Err(e)) => {
                debug!("TCP connect to {} failed: {}", addr, e);
                last_err = Some(Error::connection(format!("{}: {}", addr, e)));
            }
            Err(_) => {
                last_err = Some(Error::timeout(format!("Connect timeout: {}", addr)));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::connection("Connect failed")))
}

fn configure_socket(stream: &TcpStream) {
    #[cfg(unix)]
    {
        use socket2::SockRef;

        // Abortive close keeps high connection churn from exhausting the
        // ephemeral port range with TIME_WAIT sockets; the upstream waits for
        // the client to close first.
        let _ = SockRef::from(stream).set_linger(Some(Duration::ZERO));
    }

    #[cfg(not(unix))]
    {
        let _ = stream;
    }
}

struct TcpTx {
    /// `None` after close
    inner: Option<OwnedWriteHalf>,
}

#[async_trait]
impl TransportTx for TcpTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let half = self.inner.as_mut().ok_or(Error::NotConnected)?;
        half.write_all(&data)
            .await
            .map_err(|e| Error::send(format!("TCP write: {}", e)))?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut half) = self.inner.take() {
            let _ = half.shutdown().await;
        }
    }
}

struct TcpRx {
    inner: OwnedReadHalf,
}

#[async_trait]
impl TransportRx for TcpRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let n = self
            .inner
            .read_buf(&mut buf)
            .await
            .map_err(|e| Error::receive(format!("TCP read: {}", e)))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut stream = connect(&[addr]).await.unwrap();
        assert!(stream.tls_version().is_none());
        stream.send(Bytes::from_static(b"ping")).await.unwrap();
        let echoed = stream.receive().await.unwrap().unwrap();
        assert_eq!(echoed, "ping");
    }

    #[tokio::test]
    async fn test_connect_tries_next_candidate() {
        // First candidate refuses; second accepts.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let stream = connect(&[dead_addr, live_addr]).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut stream = connect(&[addr]).await.unwrap();
        stream.close().await;
        stream.close().await;
        assert!(stream.send(Bytes::from_static(b"x")).await.is_err());
    }
}
