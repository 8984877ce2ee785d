//! VLESS framing
//!
//! The request header travels once per connection, glued to the first
//! payload write. The 2-byte response header is consumed lazily from the
//! first bytes the server sends; servers that start streaming data directly
//! (Reality/XTLS behavior) are detected by a non-zero first byte and passed
//! through untouched.

use crate::common::Address;
use crate::transport::{BoxRx, BoxTx, Stream, TransportRx, TransportTx};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// VLESS protocol version
pub const VLESS_VERSION: u8 = 0x00;

/// VLESS command types
pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;
pub const CMD_MUX: u8 = 0x03;

/// Build the request header. The mux control channel (command 0x03) omits
/// the address block; its conventional target stays off the wire.
pub fn encode_request(
    uuid: &Uuid,
    flow: Option<&str>,
    command: u8,
    target: Option<&Address>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u8(VLESS_VERSION);
    buf.put_slice(uuid.as_bytes());

    let addons = encode_addons(flow);
    buf.put_u8(addons.len() as u8);
    buf.put_slice(&addons);

    buf.put_u8(command);
    if command != CMD_MUX {
        if let Some(target) = target {
            target.encode_port_first(&mut buf);
        }
    }
    buf.freeze()
}

/// Addons protobuf: `Addons { flow: string = field 1 }`, encoded as tag
/// `0x0A`, one-byte length, then the flow string.
fn encode_addons(flow: Option<&str>) -> Vec<u8> {
    match flow {
        Some(flow) if !flow.is_empty() => {
            let mut buf = Vec::with_capacity(2 + flow.len());
            buf.push(0x0A);
            buf.push(flow.len() as u8);
            buf.extend_from_slice(flow.as_bytes());
            buf
        }
        _ => Vec::new(),
    }
}

/// Lazy response-header strip state
#[derive(Default)]
pub(crate) struct ResponseHeader {
    state: HeaderState,
}

#[derive(Default)]
enum HeaderState {
    #[default]
    Start,
    /// Version byte (zero) consumed, addons length still unknown
    SeenVersion,
    /// Known number of header bytes left to discard
    Skipping(usize),
    Done,
}

impl ResponseHeader {
    /// Consume header bytes from the front of `chunk`; returns the data
    /// remainder (possibly empty while the header is incomplete).
    pub(crate) fn strip(&mut self, chunk: Bytes) -> Bytes {
        match self.state {
            HeaderState::Done => chunk,
            HeaderState::Start => {
                if chunk.is_empty() {
                    return chunk;
                }
                if chunk[0] != VLESS_VERSION {
                    // Header absent; everything is data
                    self.state = HeaderState::Done;
                    return chunk;
                }
                if chunk.len() == 1 {
                    self.state = HeaderState::SeenVersion;
                    return Bytes::new();
                }
                let skip = 2 + chunk[1] as usize;
                self.advance(chunk, skip)
            }
            HeaderState::SeenVersion => {
                if chunk.is_empty() {
                    return chunk;
                }
                let skip = 1 + chunk[0] as usize;
                self.advance(chunk, skip)
            }
            HeaderState::Skipping(remaining) => self.advance(chunk, remaining),
        }
    }

    fn advance(&mut self, chunk: Bytes, skip: usize) -> Bytes {
        if chunk.len() >= skip {
            self.state = HeaderState::Done;
            chunk.slice(skip..)
        } else {
            self.state = HeaderState::Skipping(skip - chunk.len());
            Bytes::new()
        }
    }
}

/// Write half: prefixes the request header onto the first send
pub(crate) struct VlessTx {
    inner: BoxTx,
    header: Option<Bytes>,
}

#[async_trait]
impl TransportTx for VlessTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        match self.header.take() {
            Some(header) => {
                let mut buf = BytesMut::with_capacity(header.len() + data.len());
                buf.put_slice(&header);
                buf.put_slice(&data);
                self.inner.send(buf.freeze()).await
            }
            None => {
                if data.is_empty() {
                    return Ok(());
                }
                self.inner.send(data).await
            }
        }
    }

    async fn send_direct(&mut self, data: Bytes) -> Result<()> {
        self.inner.send_direct(data).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// Read half: strips the response header off the byte prefix
pub(crate) struct VlessRx {
    inner: BoxRx,
    header: ResponseHeader,
}

#[async_trait]
impl TransportRx for VlessRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.inner.receive().await? {
                Some(chunk) => {
                    let data = self.header.strip(chunk);
                    if !data.is_empty() {
                        return Ok(Some(data));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    async fn receive_direct(&mut self) -> Result<Option<Bytes>> {
        self.inner.receive_direct().await
    }
}

/// Wrap a transport into a VLESS-TCP connection. The header rides with the
/// first payload write (send an empty buffer to flush it alone).
pub fn wrap(inner: Stream, uuid: &Uuid, flow: Option<&str>, command: u8, target: Option<&Address>) -> Stream {
    let tls_version = inner.tls_version();
    let (tx, rx) = inner.into_split();
    let header = encode_request(uuid, flow, command, target);
    let mut stream = Stream::new(
        Box::new(VlessTx {
            inner: tx,
            header: Some(header),
        }),
        Box::new(VlessRx {
            inner: rx,
            header: ResponseHeader::default(),
        }),
    );
    if let Some(version) = tls_version {
        stream = stream.with_tls_version(version);
    }
    stream
}

/// Write half for VLESS-UDP: each datagram is `u16-be len` framed
struct VlessUdpTx {
    inner: VlessTx,
}

#[async_trait]
impl TransportTx for VlessUdpTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut buf = BytesMut::with_capacity(data.len() + 2);
        buf.put_u16(data.len() as u16);
        buf.put_slice(&data);
        self.inner.send(buf.freeze()).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// Read half for VLESS-UDP: buffers partial frames, emits whole datagrams
struct VlessUdpRx {
    inner: VlessRx,
    buf: BytesMut,
}

#[async_trait]
impl TransportRx for VlessUdpRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.buf.len() >= 2 {
                let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                if self.buf.len() >= 2 + len {
                    let _ = self.buf.split_to(2);
                    return Ok(Some(self.buf.split_to(len).freeze()));
                }
            }
            match self.inner.receive().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::invalid_frame("EOF inside VLESS UDP frame"));
                }
            }
        }
    }
}

/// Wrap a transport into a VLESS-UDP connection to `target`
pub fn wrap_udp(inner: Stream, uuid: &Uuid, flow: Option<&str>, target: &Address) -> Stream {
    let (tx, rx) = inner.into_split();
    let header = encode_request(uuid, flow, CMD_UDP, Some(target));
    Stream::new(
        Box::new(VlessUdpTx {
            inner: VlessTx {
                inner: tx,
                header: Some(header),
            },
        }),
        Box::new(VlessUdpRx {
            inner: VlessRx {
                inner: rx,
                header: ResponseHeader::default(),
            },
            buf: BytesMut::new(),
        }),
    )
}
