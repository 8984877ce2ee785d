//! In-memory transport pair for wire-level tests

use super::{BoxRx, BoxTx, Stream, TransportRx, TransportTx};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Two connected streams; bytes sent on one arrive on the other.
pub fn pair() -> (Stream, Stream) {
    let (a_tx, b_rx) = mpsc::channel::<Bytes>(64);
    let (b_tx, a_rx) = mpsc::channel::<Bytes>(64);
    (
        Stream::new(
            Box::new(ChanTx { tx: Some(a_tx) }) as BoxTx,
            Box::new(ChanRx { rx: a_rx }) as BoxRx,
        ),
        Stream::new(
            Box::new(ChanTx { tx: Some(b_tx) }) as BoxTx,
            Box::new(ChanRx { rx: b_rx }) as BoxRx,
        ),
    )
}

pub struct ChanTx {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl TransportTx for ChanTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(crate::Error::NotConnected)?;
        tx.send(data)
            .await
            .map_err(|_| crate::Error::send("peer gone"))?;
        Ok(())
    }

    // The in-memory pair stands in for a record layer in direct-copy tests
    async fn send_direct(&mut self, data: Bytes) -> Result<()> {
        self.send(data).await
    }

    async fn close(&mut self) {
        self.tx.take();
    }
}

pub struct ChanRx {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl TransportRx for ChanRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn receive_direct(&mut self) -> Result<Option<Bytes>> {
        self.receive().await
    }
}

/// Collect everything currently sent on `rx` into one buffer without
/// blocking on further traffic.
pub async fn drain_available(stream: &mut Stream, max_chunks: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for _ in 0..max_chunks {
        match tokio::time::timeout(std::time::Duration::from_millis(50), stream.receive()).await {
            Ok(Ok(Some(chunk))) => out.extend_from_slice(&chunk),
            _ => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut a, mut b) = pair();
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b.receive().await.unwrap().unwrap(), "hello");

        a.close().await;
        assert!(b.receive().await.unwrap().is_none());
    }
}
