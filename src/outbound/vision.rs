//! XTLS Vision traffic shaping
//!
//! Pads and reshapes the VLESS byte stream until enough of the inner TLS
//! handshake has been observed to switch to a direct-copy fast path that
//! bypasses the outer record encryption. The writer and reader state
//! machines are independent; the few flags they share (TLS detection, the
//! negotiated inner cipher, the filter countdown) live behind a short-held
//! lock.

use crate::transport::{BoxRx, BoxTx, Stream, TransportRx, TransportTx};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Vision frame commands
const CMD_PADDING_CONTINUE: u8 = 0x00;
const CMD_PADDING_END: u8 = 0x01;
const CMD_PADDING_END_DIRECT: u8 = 0x02;

/// Frame buffer ceiling and the header overhead of the first frame
/// (16-byte uuid + command + two u16 lengths)
const FRAME_CAP: usize = 8192;
const FIRST_HEADER_LEN: usize = 21;

/// Largest content one frame may carry
const MAX_CONTENT: usize = FRAME_CAP - FIRST_HEADER_LEN;

/// Packets inspected before the filter gives up (both directions share it)
const FILTER_PACKETS: u32 = 8;

/// TLS 1.3 supported-versions extension bytes scanned for in the ServerHello
const TLS13_SUPPORTED_VERSIONS: [u8; 6] = [0x00, 0x2B, 0x00, 0x02, 0x03, 0x04];

/// Flags shared between the reader and writer
struct SharedState {
    is_tls: bool,
    is_tls12_or_above: bool,
    enable_xtls: bool,
    filter_remaining: u32,
    cipher: u16,
    remaining_server_hello: usize,
}

/// Wrap a VLESS stream with the Vision shaping layer
pub fn wrap(inner: Stream, uuid: &Uuid, padding_seed: [u32; 4]) -> Stream {
    let shared = Arc::new(Mutex::new(SharedState {
        is_tls: false,
        is_tls12_or_above: false,
        enable_xtls: false,
        filter_remaining: FILTER_PACKETS,
        cipher: 0,
        remaining_server_hello: 0,
    }));
    let (tx, rx) = inner.into_split();
    Stream::new(
        Box::new(VisionTx {
            inner: tx,
            shared: shared.clone(),
            uuid: *uuid.as_bytes(),
            uuid_sent: false,
            is_padding: true,
            direct_copy: false,
            seed: padding_seed,
        }),
        Box::new(VisionRx {
            inner: rx,
            shared,
            uuid: *uuid.as_bytes(),
            state: UnpadState::Uuid,
            current_command: CMD_PADDING_CONTINUE,
            remaining_content: 0,
            remaining_padding: 0,
            direct_copy: false,
            buf: BytesMut::new(),
        }),
    )
}

/// True when `data` is a back-to-back sequence of complete TLS
/// application-data records ending exactly at the buffer end.
fn is_complete_tls_app_data(data: &[u8]) -> bool {
    if data.first() != Some(&0x17) {
        return false;
    }
    let mut offset = 0;
    while offset < data.len() {
        if data.len() < offset + 5
            || data[offset] != 0x17
            || data[offset + 1] != 0x03
            || data[offset + 2] != 0x03
        {
            return false;
        }
        let len = u16::from_be_bytes([data[offset + 3], data[offset + 4]]) as usize;
        offset += 5 + len;
    }
    offset == data.len()
}

/// Split an oversize buffer along the last TLS record boundary in the
/// window, else at the midpoint; repeat until all pieces fit one frame.
fn reshape(data: Bytes) -> Vec<Bytes> {
    if data.len() <= MAX_CONTENT {
        return vec![data];
    }
    let window = &data[..MAX_CONTENT.min(data.len())];
    let mut cut = data.len() / 2;
    for i in (FIRST_HEADER_LEN..window.len().saturating_sub(2)).rev() {
        if window[i] == 0x17 && window[i + 1] == 0x03 && window[i + 2] == 0x03 {
            cut = i;
            break;
        }
    }
    let cut = cut.clamp(1, data.len() - 1);
    let mut out = reshape(data.slice(..cut));
    out.extend(reshape(data.slice(cut..)));
    out
}

struct VisionTx {
    inner: BoxTx,
    shared: Arc<Mutex<SharedState>>,
    uuid: [u8; 16],
    uuid_sent: bool,
    is_padding: bool,
    direct_copy: bool,
    seed: [u32; 4],
}

impl VisionTx {
    fn padding_len(&self, content: usize, is_tls: bool) -> usize {
        let mut rng = rand::thread_rng();
        let [threshold, long_max, long_base, short_max] = self.seed;
        let padding = if (content as u64) < threshold as u64 && is_tls {
            (rng.gen_range(0..long_max.max(1)) as i64) + long_base as i64 - content as i64
        } else {
            rng.gen_range(0..short_max.max(1)) as i64
        };
        padding.clamp(0, (FRAME_CAP - FIRST_HEADER_LEN - content) as i64) as usize
    }
}

#[async_trait]
impl TransportTx for VisionTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if self.direct_copy {
            return self.inner.send_direct(data).await;
        }

        let (is_tls, enable_xtls, compat_exit) = {
            let mut st = self.shared.lock();
            if st.filter_remaining > 0 {
                if data.len() >= 6 && data[0] == 0x16 && data[1] == 0x03 && data[5] == 0x01 {
                    st.is_tls = true;
                }
                st.filter_remaining -= 1;
            }
            (
                st.is_tls,
                st.enable_xtls,
                !st.is_tls12_or_above && st.filter_remaining <= 1,
            )
        };

        if !self.is_padding {
            return self.inner.send(data).await;
        }

        let leave_padding = is_complete_tls_app_data(&data) || compat_exit;
        let chunks = reshape(data);
        let last = chunks.len() - 1;

        let mut wire = BytesMut::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let command = if i == last && leave_padding {
                if enable_xtls {
                    CMD_PADDING_END_DIRECT
                } else {
                    CMD_PADDING_END
                }
            } else {
                CMD_PADDING_CONTINUE
            };
            let padding = self.padding_len(chunk.len(), is_tls);

            if !self.uuid_sent {
                wire.put_slice(&self.uuid);
                self.uuid_sent = true;
            }
            wire.put_u8(command);
            wire.put_u16(chunk.len() as u16);
            wire.put_u16(padding as u16);
            wire.put_slice(&chunk);
            let mut filler = vec![0u8; padding];
            rand::thread_rng().fill(filler.as_mut_slice());
            wire.put_slice(&filler);
        }

        self.inner.send(wire.freeze()).await?;

        if leave_padding {
            self.is_padding = false;
            if enable_xtls {
                self.direct_copy = true;
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

enum UnpadState {
    /// First frame must open with the user uuid; anything else means the
    /// peer is not padding and the stream passes through unchanged.
    Uuid,
    Header,
    Content,
    Padding,
    /// Padding finished (command 1 or 2); remaining bytes are plain data
    Through,
    /// uuid mismatch on the first frame
    Passthrough,
}

struct VisionRx {
    inner: BoxRx,
    shared: Arc<Mutex<SharedState>>,
    uuid: [u8; 16],
    state: UnpadState,
    current_command: u8,
    remaining_content: usize,
    remaining_padding: usize,
    direct_copy: bool,
    buf: BytesMut,
}

impl VisionRx {
    /// Advance the unpadding machine; returns produced output (possibly
    /// empty when more input is needed).
    fn unpad(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        loop {
            match self.state {
                UnpadState::Uuid => {
                    if self.buf.len() < 16 {
                        return out;
                    }
                    if self.buf[..16].ct_eq(&self.uuid).unwrap_u8() == 1 {
                        self.buf.advance(16);
                        self.state = UnpadState::Header;
                    } else {
                        self.state = UnpadState::Passthrough;
                    }
                }
                UnpadState::Header => {
                    if self.buf.len() < 5 {
                        return out;
                    }
                    self.current_command = self.buf[0];
                    self.remaining_content =
                        u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
                    self.remaining_padding =
                        u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
                    self.buf.advance(5);
                    self.state = UnpadState::Content;
                }
                UnpadState::Content => {
                    let take = self.remaining_content.min(self.buf.len());
                    if take > 0 {
                        out.put_slice(&self.buf.split_to(take));
                        self.remaining_content -= take;
                    }
                    if self.remaining_content > 0 {
                        return out;
                    }
                    self.state = UnpadState::Padding;
                }
                UnpadState::Padding => {
                    let drop = self.remaining_padding.min(self.buf.len());
                    self.buf.advance(drop);
                    self.remaining_padding -= drop;
                    if self.remaining_padding > 0 {
                        return out;
                    }
                    match self.current_command {
                        CMD_PADDING_CONTINUE => self.state = UnpadState::Header,
                        CMD_PADDING_END => self.state = UnpadState::Through,
                        CMD_PADDING_END_DIRECT => {
                            self.direct_copy = true;
                            self.state = UnpadState::Through;
                        }
                        _ => self.state = UnpadState::Through,
                    }
                }
                UnpadState::Through | UnpadState::Passthrough => {
                    out.put_slice(&self.buf.split());
                    return out;
                }
            }
        }
    }

    fn still_unpadding(&self) -> bool {
        !matches!(self.state, UnpadState::Through | UnpadState::Passthrough)
    }

    /// Inspect server-to-client plaintext for the inner ServerHello and the
    /// TLS 1.3 supported-versions marker.
    fn filter(&self, data: &[u8]) {
        let mut st = self.shared.lock();
        if st.filter_remaining == 0 {
            return;
        }
        st.filter_remaining -= 1;

        if data.len() > 5
            && data[0] == 0x16
            && data[1] == 0x03
            && data[2] == 0x03
            && data[5] == 0x02
        {
            st.is_tls = true;
            st.is_tls12_or_above = true;
            st.remaining_server_hello = u16::from_be_bytes([data[3], data[4]]) as usize + 5;
            if data.len() >= 79 {
                let sid_len = data[43] as usize;
                let cipher_at = 43 + sid_len + 1;
                if data.len() >= cipher_at + 2 {
                    st.cipher = u16::from_be_bytes([data[cipher_at], data[cipher_at + 1]]);
                }
            }
        }

        if st.remaining_server_hello > 0 {
            let n = st.remaining_server_hello.min(data.len());
            if data[..n]
                .windows(TLS13_SUPPORTED_VERSIONS.len())
                .any(|w| w == TLS13_SUPPORTED_VERSIONS)
            {
                if matches!(st.cipher, 0x1301 | 0x1302 | 0x1303 | 0x1304) {
                    st.enable_xtls = true;
                }
                st.filter_remaining = 0;
            } else {
                st.remaining_server_hello -= n;
                if st.remaining_server_hello == 0 {
                    // ServerHello exhausted without the 1.3 marker: inner
                    // stream is TLS 1.2, nothing more to learn.
                    st.filter_remaining = 0;
                }
            }
        }
    }
}

#[async_trait]
impl TransportRx for VisionRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.direct_copy && self.buf.is_empty() && !self.still_unpadding() {
                return self.inner.receive_direct().await;
            }

            if !self.buf.is_empty() || !self.still_unpadding() {
                let out = if self.still_unpadding() {
                    self.unpad()
                } else {
                    self.buf.split()
                };
                if !out.is_empty() {
                    self.filter(&out);
                    return Ok(Some(out.freeze()));
                }
            }

            match self.inner.receive().await {
                Ok(Some(chunk)) => self.buf.extend_from_slice(&chunk),
                Ok(None) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::invalid_frame("EOF inside Vision frame"));
                }
                Err(Error::Decryption(raw)) => {
                    // The server already switched to direct copy; its raw
                    // ciphertext flows through unchanged.
                    if !self.direct_copy {
                        return Ok(Some(raw));
                    }
                    return Err(Error::Decryption(raw));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PADDING_SEED;
    use crate::transport::testing;

    fn test_uuid() -> Uuid {
        Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap()
    }

    fn app_record(len: usize) -> Bytes {
        let mut rec = BytesMut::new();
        rec.put_slice(&[0x17, 0x03, 0x03]);
        rec.put_u16(len as u16);
        rec.put_slice(&vec![0xEE; len]);
        rec.freeze()
    }

    #[tokio::test]
    async fn test_first_frame_shape_for_non_tls_send() {
        // Fresh writer, 40 bytes of non-TLS payload, default seed
        let (near, mut far) = testing::pair();
        let mut vision = wrap(near, &test_uuid(), DEFAULT_PADDING_SEED);

        vision.send(Bytes::from(vec![0x55u8; 40])).await.unwrap();
        let wire = far.receive().await.unwrap().unwrap();

        assert_eq!(&wire[..16], test_uuid().as_bytes());
        assert_eq!(wire[16], CMD_PADDING_CONTINUE);
        assert_eq!(&wire[17..19], &[0x00, 0x28]);
        let padding = u16::from_be_bytes([wire[19], wire[20]]) as usize;
        assert!(padding <= 255);
        assert_eq!(&wire[21..61], &vec![0x55u8; 40][..]);
        assert_eq!(wire.len(), 21 + 40 + padding);
    }

    #[tokio::test]
    async fn test_uuid_sent_only_once() {
        let (near, mut far) = testing::pair();
        let mut vision = wrap(near, &test_uuid(), DEFAULT_PADDING_SEED);

        vision.send(Bytes::from_static(b"first")).await.unwrap();
        vision.send(Bytes::from_static(b"second")).await.unwrap();

        let first = far.receive().await.unwrap().unwrap();
        assert_eq!(&first[..16], test_uuid().as_bytes());
        let second = far.receive().await.unwrap().unwrap();
        // Second frame starts directly with the command byte
        assert_eq!(second[0], CMD_PADDING_CONTINUE);
        assert_eq!(
            u16::from_be_bytes([second[1], second[2]]) as usize,
            "second".len()
        );
    }

    #[test]
    fn test_reshape_boundaries() {
        assert_eq!(reshape(Bytes::from(vec![0u8; 8171])).len(), 1);
        let pieces = reshape(Bytes::from(vec![0u8; 8172]));
        assert!(pieces.len() >= 2);
        assert_eq!(pieces.iter().map(|p| p.len()).sum::<usize>(), 8172);
        for piece in &pieces {
            assert!(piece.len() <= MAX_CONTENT);
        }
    }

    #[test]
    fn test_reshape_prefers_record_boundary() {
        // Two app-data records spanning past the window: the split lands on
        // the record boundary, so the second piece starts with 0x17 0x03 0x03
        let mut data = BytesMut::new();
        data.put_slice(&app_record(6000));
        data.put_slice(&app_record(6000));
        let pieces = reshape(data.freeze());
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].len(), 6005);
        assert_eq!(&pieces[1][..3], &[0x17, 0x03, 0x03]);
    }

    #[test]
    fn test_complete_app_data_detection() {
        assert!(is_complete_tls_app_data(&app_record(32)));
        let mut two = BytesMut::new();
        two.put_slice(&app_record(10));
        two.put_slice(&app_record(20));
        assert!(is_complete_tls_app_data(&two));

        let mut partial = app_record(32).to_vec();
        partial.pop();
        assert!(!is_complete_tls_app_data(&partial));
        assert!(!is_complete_tls_app_data(b"\x16\x03\x03\x00\x01\x01"));
        assert!(!is_complete_tls_app_data(&[]));
    }

    #[tokio::test]
    async fn test_writer_leaves_padding_on_complete_record() {
        let (near, mut far) = testing::pair();
        let mut vision = wrap(near, &test_uuid(), DEFAULT_PADDING_SEED);

        vision.send(app_record(64)).await.unwrap();
        let wire = far.receive().await.unwrap().unwrap();
        assert_eq!(wire[16], CMD_PADDING_END);

        // Padding left: next send is raw passthrough
        vision.send(Bytes::from_static(b"after")).await.unwrap();
        assert_eq!(far.receive().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn test_writer_direct_copy_when_xtls_enabled() {
        let (near, mut far) = testing::pair();
        let mut vision = wrap(near, &test_uuid(), DEFAULT_PADDING_SEED);

        // Reader observes a TLS 1.3 ServerHello for suite 0x1301
        let mut sh = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_u8(0x02); // ServerHello
        body.put_slice(&[0x00, 0x00, 0x4C]);
        body.put_slice(&[0x03, 0x03]);
        body.put_slice(&[7u8; 32]); // random
        body.put_u8(0); // sid len
        body.put_slice(&[0x13, 0x01]);
        body.put_u8(0);
        body.put_slice(&TLS13_SUPPORTED_VERSIONS);
        sh.put_slice(&[0x16, 0x03, 0x03]);
        sh.put_u16(body.len() as u16);
        sh.put_slice(&body);

        // Frame it as the server's Vision writer would (uuid + continue)
        let mut frame = BytesMut::new();
        frame.put_slice(test_uuid().as_bytes());
        frame.put_u8(CMD_PADDING_CONTINUE);
        frame.put_u16(sh.len() as u16);
        frame.put_u16(0);
        frame.put_slice(&sh);
        far.send(frame.freeze()).await.unwrap();

        let unpadded = vision.receive().await.unwrap().unwrap();
        assert_eq!(&unpadded[..], &sh[..]);

        // Writer now exits with the direct-copy command
        vision.send(app_record(16)).await.unwrap();
        let wire = far.receive().await.unwrap().unwrap();
        assert_eq!(wire[16], CMD_PADDING_END_DIRECT);

        // And subsequent sends bypass framing entirely
        vision.send(Bytes::from_static(b"raw")).await.unwrap();
        assert_eq!(far.receive().await.unwrap().unwrap(), "raw");
    }

    #[tokio::test]
    async fn test_reader_unpads_across_partial_feeds() {
        let (near, mut far) = testing::pair();
        let mut vision = wrap(near, &test_uuid(), DEFAULT_PADDING_SEED);

        let mut frame = BytesMut::new();
        frame.put_slice(test_uuid().as_bytes());
        frame.put_u8(CMD_PADDING_CONTINUE);
        frame.put_u16(5);
        frame.put_u16(3);
        frame.put_slice(b"hello");
        frame.put_slice(&[0xFF, 0xFF, 0xFF]);
        frame.put_u8(CMD_PADDING_END);
        frame.put_u16(3);
        frame.put_u16(0);
        frame.put_slice(b"bye");
        let frame = frame.freeze();

        // Drip-feed in 4-byte chunks
        let feeder = tokio::spawn(async move {
            for piece in frame.chunks(4) {
                far.send(Bytes::copy_from_slice(piece)).await.unwrap();
            }
            far
        });

        let mut collected = Vec::new();
        while collected.len() < 8 {
            let chunk = vision.receive().await.unwrap().unwrap();
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hellobye");

        // Command 1 ended padding: further bytes pass through unchanged
        let mut far = feeder.await.unwrap();
        far.send(Bytes::from_static(b"plain")).await.unwrap();
        assert_eq!(vision.receive().await.unwrap().unwrap(), "plain");
    }

    #[tokio::test]
    async fn test_reader_passthrough_without_uuid_prefix() {
        let (near, mut far) = testing::pair();
        let mut vision = wrap(near, &test_uuid(), DEFAULT_PADDING_SEED);

        let raw = Bytes::from_static(&[0x17, 0x03, 0x03, 0x00, 0x02, 0xAA, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        far.send(raw.clone()).await.unwrap();
        assert_eq!(vision.receive().await.unwrap().unwrap(), raw);
    }

    #[tokio::test]
    async fn test_decryption_failed_passes_raw_bytes() {
        use crate::transport::{BoxRx, BoxTx};

        struct FailingRx {
            served: bool,
        }

        #[async_trait]
        impl TransportRx for FailingRx {
            async fn receive(&mut self) -> Result<Option<Bytes>> {
                if self.served {
                    return Ok(None);
                }
                self.served = true;
                Err(Error::Decryption(Bytes::from_static(&[
                    0x17, 0x03, 0x03, 0x00, 0x01, 0x5A,
                ])))
            }
        }

        let (near, _far) = testing::pair();
        let (tx, _rx) = near.into_split();
        let stream = Stream::new(tx as BoxTx, Box::new(FailingRx { served: false }) as BoxRx);
        let mut vision = wrap(stream, &test_uuid(), DEFAULT_PADDING_SEED);

        let raw = vision.receive().await.unwrap().unwrap();
        assert_eq!(&raw[..], &[0x17, 0x03, 0x03, 0x00, 0x01, 0x5A]);
    }
}
