//! Transport stack nodes
//!
//! Every layer of the outbound pipeline is a pair of exclusive halves:
//! [`TransportTx`] for the upstream direction and [`TransportRx`] for the
//! downstream direction. A layer owns its next-lower node's halves and is in
//! turn owned by the node above it. Layers that must write from their receive
//! path (WebSocket pong, HTTP/2 window updates) share the lower tx half
//! behind an async mutex held only for the duration of one send.

pub mod chunked;
pub mod h2;
pub mod httpupgrade;
pub mod tcp;
pub mod ws;
pub mod xhttp;

#[cfg(test)]
pub mod testing;

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// TLS protocol version reported by a security layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls13,
}

/// Upstream half of a transport node
#[async_trait]
pub trait TransportTx: Send {
    /// Queue `data` for delivery; completes when the layer has accepted the
    /// whole buffer. Concurrent senders are serialized by half ownership.
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Bypass the outermost encryption layer (Vision direct copy). Only
    /// record layers support this.
    async fn send_direct(&mut self, data: Bytes) -> Result<()> {
        let _ = data;
        Err(Error::protocol("Direct send not supported by this transport"))
    }

    /// Tear down the write side. Idempotent; pending peers see EOF.
    async fn close(&mut self);
}

/// Downstream half of a transport node
#[async_trait]
pub trait TransportRx: Send {
    /// Next chunk of payload bytes; `Ok(None)` is a clean EOF.
    async fn receive(&mut self) -> Result<Option<Bytes>>;

    /// Bypass the outermost encryption layer (Vision direct copy). Drains
    /// any bytes the record layer had buffered before switching.
    async fn receive_direct(&mut self) -> Result<Option<Bytes>> {
        Err(Error::protocol(
            "Direct receive not supported by this transport",
        ))
    }
}

pub type BoxTx = Box<dyn TransportTx>;
pub type BoxRx = Box<dyn TransportRx>;

/// A full-duplex transport node: paired halves plus the security attributes
/// upper layers interrogate before composing.
pub struct Stream {
    tx: BoxTx,
    rx: BoxRx,
    tls_version: Option<TlsVersion>,
}

impl Stream {
    pub fn new(tx: BoxTx, rx: BoxRx) -> Self {
        Stream {
            tx,
            rx,
            tls_version: None,
        }
    }

    pub fn with_tls_version(mut self, version: TlsVersion) -> Self {
        self.tls_version = Some(version);
        self
    }

    /// Version of the outer security layer, if one is active. Plain TCP and
    /// the plaintext HTTP adapters report `None`.
    pub fn tls_version(&self) -> Option<TlsVersion> {
        self.tls_version
    }

    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        self.tx.send(data).await
    }

    pub async fn receive(&mut self) -> Result<Option<Bytes>> {
        self.rx.receive().await
    }

    pub async fn send_direct(&mut self, data: Bytes) -> Result<()> {
        self.tx.send_direct(data).await
    }

    pub async fn receive_direct(&mut self) -> Result<Option<Bytes>> {
        self.rx.receive_direct().await
    }

    pub async fn close(&mut self) {
        self.tx.close().await;
    }

    /// Hand out the halves; the TLS tag does not survive a split.
    pub fn into_split(self) -> (BoxTx, BoxRx) {
        (self.tx, self.rx)
    }

    /// Borrow both halves for a sequential request/response exchange.
    pub fn halves_mut(&mut self) -> (&mut BoxTx, &mut BoxRx) {
        (&mut self.tx, &mut self.rx)
    }
}

/// Rx half that replays a buffered prefix (e.g. bytes read past an HTTP
/// header terminator) before the inner half.
pub struct PrefixedRx {
    prefix: Option<Bytes>,
    inner: BoxRx,
}

impl PrefixedRx {
    pub fn new(prefix: Bytes, inner: BoxRx) -> Self {
        let prefix = if prefix.is_empty() {
            None
        } else {
            Some(prefix)
        };
        PrefixedRx { prefix, inner }
    }
}

#[async_trait]
impl TransportRx for PrefixedRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        if let Some(prefix) = self.prefix.take() {
            return Ok(Some(prefix));
        }
        self.inner.receive().await
    }

    async fn receive_direct(&mut self) -> Result<Option<Bytes>> {
        if let Some(prefix) = self.prefix.take() {
            return Ok(Some(prefix));
        }
        self.inner.receive_direct().await
    }
}

/// Read bytes from `rx` into `buf` until `buf` contains `\r\n\r\n`; returns
/// the offset one past the terminator. Shared by every HTTP-speaking adapter.
pub(crate) async fn read_until_header_end(
    buf: &mut bytes::BytesMut,
    rx: &mut BoxRx,
    limit: usize,
) -> Result<usize> {
    loop {
        if let Some(pos) = find_header_end(buf) {
            return Ok(pos);
        }
        if buf.len() > limit {
            return Err(Error::invalid_response("HTTP response header too long"));
        }
        match rx.receive().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => {
                return Err(Error::invalid_response(
                    "EOF before HTTP response header end",
                ))
            }
        }
    }
}

pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\nrest"), Some(19));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[tokio::test]
    async fn test_prefixed_rx_replays_prefix() {
        let (_near, far) = testing::pair();
        let (_tx, rx) = far.into_split();
        let mut rx = PrefixedRx::new(Bytes::from_static(b"head"), rx);
        assert_eq!(rx.receive().await.unwrap().unwrap(), "head");
    }
}
