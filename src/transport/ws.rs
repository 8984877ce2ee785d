//! WebSocket transport (RFC 6455, client side)

use super::{read_until_header_end, BoxTx, Stream, TransportRx, TransportTx};
use crate::config::WsConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// WebSocket opcodes
const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Perform the client handshake and wrap `inner` in the frame codec.
///
/// When `cfg.max_early_data > 0` and `early` is non-empty, a prefix of
/// `early` rides in the early-data request header; the number of bytes so
/// consumed is returned and must not be sent again.
pub async fn connect(inner: Stream, host: &str, cfg: &WsConfig, early: &[u8]) -> Result<(Stream, usize)> {
    let (mut tx, mut rx) = inner.into_split();

    let ws_key: [u8; 16] = rand::random();
    let ws_key_b64 = base64::engine::general_purpose::STANDARD.encode(ws_key);

    let early_consumed = if cfg.max_early_data > 0 && !early.is_empty() {
        early.len().min(cfg.max_early_data)
    } else {
        0
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        cfg.path, host, ws_key_b64
    );
    for (key, value) in &cfg.headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    if early_consumed > 0 {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(&early[..early_consumed]);
        request.push_str(&format!("{}: {}\r\n", cfg.early_data_header_name, encoded));
    }
    request.push_str("\r\n");

    tx.send(Bytes::from(request.into_bytes()))
        .await
        .map_err(|e| Error::upgrade(format!("WebSocket request: {}", e)))?;

    let mut buf = BytesMut::new();
    let header_end = read_until_header_end(&mut buf, &mut rx, MAX_RESPONSE_HEADER).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf[..header_end])
        .map_err(|e| Error::upgrade(format!("Malformed WebSocket response: {}", e)))?;
    if response.code != Some(101) {
        return Err(Error::upgrade(format!(
            "WebSocket handshake failed: status {:?}",
            response.code
        )));
    }

    // Verify Sec-WebSocket-Accept
    let expected_accept = {
        let mut hasher = Sha1::new();
        hasher.update(ws_key_b64.as_bytes());
        hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    };
    let accept = response
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string());
    if accept.as_deref() != Some(expected_accept.as_str()) {
        return Err(Error::upgrade("Invalid Sec-WebSocket-Accept"));
    }

    debug!("WebSocket handshake completed");

    let writer = Arc::new(Mutex::new(tx));
    let mut frame_buf = BytesMut::new();
    frame_buf.extend_from_slice(&buf[header_end..]);

    Ok((
        Stream::new(
            Box::new(WsTx {
                writer: writer.clone(),
            }),
            Box::new(WsRx {
                inner: rx,
                buf: frame_buf,
                writer,
            }),
        ),
        early_consumed,
    ))
}

/// Apply the 4-byte XOR mask in place
fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode one masked client frame
fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    let key: [u8; 4] = rand::random();
    let mut buf = BytesMut::with_capacity(payload.len() + 14);
    buf.put_u8(0x80 | opcode);
    if payload.len() < 126 {
        buf.put_u8(0x80 | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.put_u8(0x80 | 126);
        buf.put_u16(payload.len() as u16);
    } else {
        buf.put_u8(0x80 | 127);
        buf.put_u64(payload.len() as u64);
    }
    buf.put_slice(&key);
    let start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[start..], key);
    buf.freeze()
}

/// A complete parsed frame: opcode and payload, plus total wire length
struct ParsedFrame {
    opcode: u8,
    payload: Bytes,
    wire_len: usize,
}

/// Try to parse one complete frame from the front of `buf`
fn parse_frame(buf: &[u8]) -> Result<Option<ParsedFrame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as u64;

    let (len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4usize)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10usize)
        }
        n => (n, 2usize),
    };

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    let len = usize::try_from(len).map_err(|_| Error::invalid_frame("Frame too large"))?;
    if buf.len() < offset + len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + len].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(ParsedFrame {
        opcode,
        payload: Bytes::from(payload),
        wire_len: offset + len,
    }))
}

struct WsTx {
    writer: Arc<Mutex<BoxTx>>,
}

#[async_trait]
impl TransportTx for WsTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let frame = encode_frame(OP_BINARY, &data);
        self.writer.lock().await.send(frame).await
    }

    async fn close(&mut self) {
        self.writer.lock().await.close().await;
    }
}

struct WsRx {
    inner: super::BoxRx,
    buf: BytesMut,
    /// Control frames (pong, close echo) are written from the receive path.
    writer: Arc<Mutex<BoxTx>>,
}

#[async_trait]
impl TransportRx for WsRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = parse_frame(&self.buf)? {
                let _ = self.buf.split_to(frame.wire_len);
                match frame.opcode {
                    OP_BINARY | OP_TEXT | OP_CONTINUATION => return Ok(Some(frame.payload)),
                    OP_PING => {
                        let pong = encode_frame(OP_PONG, &frame.payload);
                        self.writer.lock().await.send(pong).await?;
                        continue;
                    }
                    OP_PONG => continue,
                    OP_CLOSE => {
                        let code = if frame.payload.len() >= 2 {
                            u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                        } else {
                            1005
                        };
                        let reason =
                            String::from_utf8_lossy(&frame.payload[2.min(frame.payload.len())..])
                                .to_string();
                        let echo = encode_frame(OP_CLOSE, &frame.payload);
                        let _ = self.writer.lock().await.send(echo).await;
                        return Err(Error::ConnectionClosed { code, reason });
                    }
                    other => {
                        return Err(Error::invalid_frame(format!(
                            "Unknown WebSocket opcode: {}",
                            other
                        )))
                    }
                }
            }

            match self.inner.receive().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::invalid_frame("EOF inside WebSocket frame"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing;

    fn server_frame(opcode: u8, payload: &[u8]) -> Bytes {
        // Server frames are unmasked
        let mut buf = BytesMut::new();
        buf.put_u8(0x80 | opcode);
        assert!(payload.len() < 126);
        buf.put_u8(payload.len() as u8);
        buf.put_slice(payload);
        buf.freeze()
    }

    async fn handshaken() -> (Stream, Stream) {
        let (near, mut far) = testing::pair();
        let server = tokio::spawn(async move {
            let mut req = Vec::new();
            while super::super::find_header_end(&req).is_none() {
                req.extend_from_slice(&far.receive().await.unwrap().unwrap());
            }
            let text = String::from_utf8(req).unwrap();
            let key_line = text
                .lines()
                .find(|l| l.to_lowercase().starts_with("sec-websocket-key:"))
                .unwrap();
            let key = key_line.split(':').nth(1).unwrap().trim();
            let mut hasher = Sha1::new();
            hasher.update(key.as_bytes());
            hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
            let accept = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                 Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept
            );
            far.send(Bytes::from(response.into_bytes())).await.unwrap();
            far
        });

        let cfg = WsConfig::default();
        let (stream, consumed) = connect(near, "example.com", &cfg, &[]).await.unwrap();
        assert_eq!(consumed, 0);
        (stream, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_ping_interleave() {
        let (mut client, mut server) = handshaken().await;

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&server_frame(OP_BINARY, b"hello"));
        wire.extend_from_slice(&server_frame(OP_PING, b"abcd"));
        wire.extend_from_slice(&server_frame(OP_BINARY, b"!!!"));
        server.send(wire.freeze()).await.unwrap();

        assert_eq!(client.receive().await.unwrap().unwrap(), "hello");
        assert_eq!(client.receive().await.unwrap().unwrap(), "!!!");

        // The pong went out between the two deliveries
        let raw = server.receive().await.unwrap().unwrap();
        let pong = parse_frame(&raw).unwrap().unwrap();
        assert_eq!(pong.opcode, OP_PONG);
        assert_eq!(pong.payload, "abcd");
    }

    #[tokio::test]
    async fn test_close_echo() {
        let (mut client, mut server) = handshaken().await;

        let mut close = BytesMut::new();
        close.put_u8(0x80 | OP_CLOSE);
        close.put_u8(2);
        close.put_u16(1000);
        server.send(close.freeze()).await.unwrap();

        match client.receive().await {
            Err(Error::ConnectionClosed { code, .. }) => assert_eq!(code, 1000),
            other => panic!("expected close, got {:?}", other.map(|b| b.map(|b| b.len()))),
        }

        let raw = server.receive().await.unwrap().unwrap();
        let echo = parse_frame(&raw).unwrap().unwrap();
        assert_eq!(echo.opcode, OP_CLOSE);
        assert_eq!(&echo.payload[..], &1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_client_frames_are_masked() {
        let (mut client, mut server) = handshaken().await;
        client.send(Bytes::from_static(b"payload")).await.unwrap();
        let raw = server.receive().await.unwrap().unwrap();
        assert_eq!(raw[0], 0x80 | OP_BINARY);
        assert!(raw[1] & 0x80 != 0, "client frame must be masked");
        let frame = parse_frame(&raw).unwrap().unwrap();
        assert_eq!(frame.payload, "payload");
    }

    #[tokio::test]
    async fn test_early_data_header() {
        let (near, mut far) = testing::pair();
        let server = tokio::spawn(async move {
            let mut req = Vec::new();
            while super::super::find_header_end(&req).is_none() {
                req.extend_from_slice(&far.receive().await.unwrap().unwrap());
            }
            String::from_utf8(req).unwrap()
        });

        let cfg = WsConfig {
            max_early_data: 4,
            ..WsConfig::default()
        };
        // Handshake will fail (no response), but the request is observable.
        let client = tokio::spawn(async move {
            let _ = connect(near, "example.com", &cfg, b"abcdef").await;
        });

        let request = server.await.unwrap();
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"abcd");
        assert!(request.contains(&format!("Sec-WebSocket-Protocol: {}", expected)));
        client.abort();
    }

    #[test]
    fn test_frame_roundtrip_lengths() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![0xA5u8; len];
            let wire = encode_frame(OP_BINARY, &payload);
            let frame = parse_frame(&wire).unwrap().unwrap();
            assert_eq!(frame.wire_len, wire.len());
            assert_eq!(frame.payload.len(), len);
            assert_eq!(&frame.payload[..], &payload[..]);
        }
    }
}
