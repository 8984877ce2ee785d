//! Minimal HTTP/2 client framing for XHTTP
//!
//! One client-initiated stream (id 1) carries the whole tunnel; headers are
//! encoded against the HPACK static table only, with no Huffman coding. Only
//! the frames the tunnel can observe are handled.

use super::{BoxRx, BoxTx, Stream, TransportRx, TransportTx};
use crate::config::XhttpConfig;
use crate::transport::xhttp::padding_referer;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_PING: u8 = 0x6;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_WINDOW_UPDATE: u8 = 0x8;

const FLAG_ACK: u8 = 0x1;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

const STREAM_ID: u32 = 1;
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
const DEFAULT_WINDOW: i64 = 65_535;
const LOCAL_INITIAL_WINDOW: u32 = 4 * 1024 * 1024;
const LOCAL_CONN_WINDOW: u32 = 1 << 30;

/// Establish the HTTP/2 tunnel: preface, SETTINGS, connection window raise,
/// and the request HEADERS on stream 1 (kept open for uploads).
pub async fn connect(inner: Stream, authority: &str, cfg: &XhttpConfig) -> Result<Stream> {
    let (mut tx, rx) = inner.into_split();

    let mut wire = BytesMut::with_capacity(256);
    wire.put_slice(PREFACE);

    // SETTINGS: ENABLE_PUSH=0, INITIAL_WINDOW_SIZE=4MiB
    let mut settings = BytesMut::new();
    settings.put_u16(SETTINGS_ENABLE_PUSH);
    settings.put_u32(0);
    settings.put_u16(SETTINGS_INITIAL_WINDOW_SIZE);
    settings.put_u32(LOCAL_INITIAL_WINDOW);
    put_frame(&mut wire, FRAME_SETTINGS, 0, 0, &settings);

    // Raise the connection receive window from 65535 to 1 GiB immediately
    let mut window = BytesMut::new();
    window.put_u32(LOCAL_CONN_WINDOW - 65_535);
    put_frame(&mut wire, FRAME_WINDOW_UPDATE, 0, 0, &window);

    let block = request_header_block(authority, cfg);
    put_frame(&mut wire, FRAME_HEADERS, FLAG_END_HEADERS, STREAM_ID, &block);

    tx.send(wire.freeze())
        .await
        .map_err(|e| Error::http(format!("HTTP/2 preface: {}", e)))?;
    debug!("HTTP/2 tunnel opened to {}", authority);

    let shared = Arc::new(Shared {
        max_frame_size: AtomicUsize::new(DEFAULT_MAX_FRAME_SIZE),
        conn_window: SendWindow::new(DEFAULT_WINDOW),
        stream_window: SendWindow::new(DEFAULT_WINDOW),
        initial_window: AtomicUsize::new(DEFAULT_WINDOW as usize),
    });
    let writer = Arc::new(Mutex::new(tx));

    Ok(Stream::new(
        Box::new(H2Tx {
            writer: writer.clone(),
            shared: shared.clone(),
        }),
        Box::new(H2Rx {
            inner: rx,
            buf: BytesMut::new(),
            writer,
            shared,
            status_checked: false,
            eof: false,
        }),
    ))
}

/// HPACK request block: static-table indexed and literal-without-indexing
/// fields only, strings in raw (non-Huffman) form.
fn request_header_block(authority: &str, cfg: &XhttpConfig) -> BytesMut {
    let mut block = BytesMut::with_capacity(128);
    block.put_u8(0x83); // :method POST
    block.put_u8(0x87); // :scheme https
    if cfg.path == "/" {
        block.put_u8(0x84); // :path /
    } else {
        literal_no_index(&mut block, 4, cfg.path.as_bytes());
    }
    literal_no_index(&mut block, 1, authority.as_bytes()); // :authority
    if cfg.grpc_header {
        literal_no_index(&mut block, 31, b"application/grpc"); // content-type
    }
    let ua = cfg.user_agent.as_deref().unwrap_or(super::xhttp::DEFAULT_USER_AGENT);
    literal_no_index(&mut block, 58, ua.as_bytes()); // user-agent
    let referer = padding_referer(authority, &cfg.path);
    literal_no_index(&mut block, 51, referer.as_bytes()); // referer
    block
}

/// HPACK integer with an n-bit prefix
fn hpack_int(block: &mut BytesMut, prefix_bits: u8, flags: u8, mut value: usize) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        block.put_u8(flags | value as u8);
        return;
    }
    block.put_u8(flags | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        block.put_u8((value % 128) as u8 | 0x80);
        value /= 128;
    }
    block.put_u8(value as u8);
}

/// Literal header field without indexing, indexed name, raw string value
fn literal_no_index(block: &mut BytesMut, name_index: usize, value: &[u8]) {
    hpack_int(block, 4, 0x00, name_index);
    hpack_int(block, 7, 0x00, value.len());
    block.put_slice(value);
}

fn put_frame(wire: &mut BytesMut, frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    wire.put_uint(payload.len() as u64, 3);
    wire.put_u8(frame_type);
    wire.put_u8(flags);
    wire.put_u32(stream_id & 0x7FFF_FFFF);
    wire.put_slice(payload);
}

fn single_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut wire = BytesMut::with_capacity(9 + payload.len());
    put_frame(&mut wire, frame_type, flags, stream_id, payload);
    wire.freeze()
}

/// Peer-granted send window with async waiting
struct SendWindow {
    avail: parking_lot::Mutex<i64>,
    notify: Notify,
}

impl SendWindow {
    fn new(initial: i64) -> Self {
        SendWindow {
            avail: parking_lot::Mutex::new(initial),
            notify: Notify::new(),
        }
    }

    fn add(&self, n: i64) {
        *self.avail.lock() += n;
        self.notify.notify_waiters();
    }

    async fn take(&self, n: i64) {
        loop {
            let notified = self.notify.notified();
            {
                let mut avail = self.avail.lock();
                if *avail >= n {
                    *avail -= n;
                    return;
                }
            }
            notified.await;
        }
    }
}

struct Shared {
    max_frame_size: AtomicUsize,
    conn_window: SendWindow,
    stream_window: SendWindow,
    initial_window: AtomicUsize,
}

struct H2Tx {
    writer: Arc<Mutex<BoxTx>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportTx for H2Tx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let max = self.shared.max_frame_size.load(Ordering::Relaxed).max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + max).min(data.len());
            let piece = &data[offset..end];
            self.shared.conn_window.take(piece.len() as i64).await;
            self.shared.stream_window.take(piece.len() as i64).await;
            let frame = single_frame(FRAME_DATA, 0, STREAM_ID, piece);
            self.writer.lock().await.send(frame).await?;
            offset = end;
        }
        Ok(())
    }

    async fn close(&mut self) {
        // Half-close the request stream
        let frame = single_frame(FRAME_DATA, FLAG_END_STREAM, STREAM_ID, &[]);
        let mut writer = self.writer.lock().await;
        let _ = writer.send(frame).await;
        writer.close().await;
    }
}

struct H2Rx {
    inner: BoxRx,
    buf: BytesMut,
    writer: Arc<Mutex<BoxTx>>,
    shared: Arc<Shared>,
    status_checked: bool,
    eof: bool,
}

impl H2Rx {
    /// Handle one non-DATA frame; may write control frames back.
    async fn handle_control(&mut self, frame_type: u8, flags: u8, stream_id: u32, payload: Bytes) -> Result<()> {
        match frame_type {
            FRAME_SETTINGS => {
                if flags & FLAG_ACK != 0 {
                    return Ok(());
                }
                let mut offset = 0;
                while offset + 6 <= payload.len() {
                    let id = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
                    let value = u32::from_be_bytes([
                        payload[offset + 2],
                        payload[offset + 3],
                        payload[offset + 4],
                        payload[offset + 5],
                    ]);
                    match id {
                        SETTINGS_INITIAL_WINDOW_SIZE => {
                            let prev = self
                                .shared
                                .initial_window
                                .swap(value as usize, Ordering::Relaxed);
                            self.shared.stream_window.add(value as i64 - prev as i64);
                        }
                        SETTINGS_MAX_FRAME_SIZE => {
                            self.shared
                                .max_frame_size
                                .store(value as usize, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                    offset += 6;
                }
                let ack = single_frame(FRAME_SETTINGS, FLAG_ACK, 0, &[]);
                self.writer.lock().await.send(ack).await?;
            }
            FRAME_PING => {
                if flags & FLAG_ACK == 0 {
                    let ack = single_frame(FRAME_PING, FLAG_ACK, 0, &payload);
                    self.writer.lock().await.send(ack).await?;
                }
            }
            FRAME_WINDOW_UPDATE => {
                if payload.len() >= 4 {
                    let increment =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                            & 0x7FFF_FFFF;
                    if stream_id == 0 {
                        self.shared.conn_window.add(increment as i64);
                    } else {
                        self.shared.stream_window.add(increment as i64);
                    }
                }
            }
            FRAME_HEADERS => {
                if stream_id == STREAM_ID && !self.status_checked {
                    self.status_checked = true;
                    check_response_status(flags, &payload)?;
                }
            }
            FRAME_GOAWAY | FRAME_RST_STREAM => {
                self.eof = true;
            }
            _ => {}
        }
        Ok(())
    }
}

/// The response block must begin with `:status 200`: either the static-table
/// indexed form (0x88) or a literal with incremental indexing against name
/// index 8 and the raw value "200".
fn check_response_status(flags: u8, payload: &[u8]) -> Result<()> {
    let mut offset = 0;
    if flags & FLAG_PADDED != 0 {
        offset += 1;
    }
    if flags & FLAG_PRIORITY != 0 {
        offset += 5;
    }
    let block = &payload[offset.min(payload.len())..];
    if block.first() == Some(&0x88) {
        return Ok(());
    }
    if block.len() >= 5 && block[0] == 0x48 && block[1] == 0x03 && &block[2..5] == b"200" {
        return Ok(());
    }
    Err(Error::http("HTTP/2 response status is not 200"))
}

#[async_trait]
impl TransportRx for H2Rx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.eof {
                return Ok(None);
            }

            // One whole frame: 9-byte header + payload
            if self.buf.len() >= 9 {
                let len = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
                if self.buf.len() >= 9 + len {
                    let header = self.buf.split_to(9);
                    let frame_type = header[3];
                    let flags = header[4];
                    let stream_id =
                        u32::from_be_bytes([header[5], header[6], header[7], header[8]])
                            & 0x7FFF_FFFF;
                    let payload = self.buf.split_to(len).freeze();

                    if frame_type == FRAME_DATA && stream_id == STREAM_ID {
                        let mut data = payload;
                        if flags & FLAG_PADDED != 0 && !data.is_empty() {
                            let pad = data[0] as usize;
                            data = data.slice(1..data.len().saturating_sub(pad));
                        }
                        if flags & FLAG_END_STREAM != 0 {
                            self.eof = true;
                        }
                        if !data.is_empty() {
                            // Replenish both receive windows by what arrived
                            let mut update = BytesMut::new();
                            update.put_u32(data.len() as u32);
                            let mut wire = BytesMut::with_capacity(26);
                            put_frame(&mut wire, FRAME_WINDOW_UPDATE, 0, STREAM_ID, &update);
                            put_frame(&mut wire, FRAME_WINDOW_UPDATE, 0, 0, &update);
                            self.writer.lock().await.send(wire.freeze()).await?;
                            return Ok(Some(data));
                        }
                        continue;
                    }

                    self.handle_control(frame_type, flags, stream_id, payload)
                        .await?;
                    continue;
                }
            }

            match self.inner.receive().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }
}
