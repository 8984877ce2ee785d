//! Mux multiplexer (mux.cool client side)
//!
//! Many logical TCP/UDP streams ride one outer VLESS connection as
//! length-prefixed metadata+payload frames. A single writer task drains the
//! frame queue, which makes whole-frame atomicity structural; a single
//! reader task demultiplexes into per-session channels.

use crate::common::{Address, Network};
use crate::transport::Stream;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Frame status values
pub const STATUS_NEW: u8 = 0x01;
pub const STATUS_KEEP: u8 = 0x02;
pub const STATUS_END: u8 = 0x03;
pub const STATUS_KEEPALIVE: u8 = 0x04;

/// Option bits
pub const OPTION_DATA: u8 = 0x01;
pub const OPTION_ERROR: u8 = 0x02;

/// Network tags
pub const NETWORK_TCP: u8 = 0x01;
pub const NETWORK_UDP: u8 = 0x02;

/// A client with no sessions is torn down after this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(16);

/// Per-session buffered datagrams/chunks before backpressure
const SESSION_QUEUE: usize = 64;

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
    pub session_id: u16,
    pub status: u8,
    pub option: u8,
    pub network: u8,
    pub target: Option<Address>,
    pub global_id: Option<[u8; 8]>,
}

impl FrameMeta {
    fn bare(session_id: u16, status: u8, option: u8) -> Self {
        FrameMeta {
            session_id,
            status,
            option,
            network: 0,
            target: None,
            global_id: None,
        }
    }
}

/// Encode one whole frame: `u16 meta_len, meta, [u16 payload_len, payload]`
pub fn encode_frame(meta: &FrameMeta, payload: Option<&[u8]>) -> Bytes {
    let mut body = BytesMut::with_capacity(64);
    body.put_u16(meta.session_id);
    body.put_u8(meta.status);
    body.put_u8(meta.option);

    let carries_address =
        meta.status == STATUS_NEW || (meta.status == STATUS_KEEP && meta.target.is_some());
    if carries_address {
        body.put_u8(meta.network);
        if let Some(target) = &meta.target {
            target.encode_port_first(&mut body);
        }
        if meta.status == STATUS_NEW {
            if let Some(global_id) = &meta.global_id {
                body.put_slice(global_id);
            }
        }
    }

    let mut frame = BytesMut::with_capacity(body.len() + 4 + payload.map_or(0, |p| p.len() + 2));
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);
    if meta.option & OPTION_DATA != 0 {
        let payload = payload.unwrap_or(&[]);
        frame.put_u16(payload.len() as u16);
        frame.put_slice(payload);
    }
    frame.freeze()
}

/// Streaming frame parser; feed arbitrary splits, take whole frames.
#[derive(Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next whole `(metadata, payload)` pair, or `None` until one is buffered
    pub fn next_frame(&mut self) -> Result<Option<(FrameMeta, Option<Bytes>)>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let meta_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if meta_len < 4 {
            return Err(Error::invalid_frame("Mux metadata too short"));
        }
        if self.buf.len() < 2 + meta_len {
            return Ok(None);
        }

        let meta_bytes = &self.buf[2..2 + meta_len];
        let session_id = u16::from_be_bytes([meta_bytes[0], meta_bytes[1]]);
        let status = meta_bytes[2];
        let option = meta_bytes[3];

        let mut network = 0;
        let mut target = None;
        let mut global_id = None;
        if status == STATUS_NEW || (status == STATUS_KEEP && meta_len > 4) {
            let rest = &meta_bytes[4..];
            if rest.is_empty() {
                return Err(Error::invalid_frame("Mux address block truncated"));
            }
            network = rest[0];
            match Address::decode_port_first(&rest[1..])? {
                Some((address, used)) => {
                    target = Some(address);
                    let tail = &rest[1 + used..];
                    if status == STATUS_NEW && tail.len() == 8 {
                        let mut id = [0u8; 8];
                        id.copy_from_slice(tail);
                        global_id = Some(id);
                    }
                }
                None => return Err(Error::invalid_frame("Mux address block truncated")),
            }
        }

        // Payload length, when the data option is set
        let mut consumed = 2 + meta_len;
        let payload = if option & OPTION_DATA != 0 {
            if self.buf.len() < consumed + 2 {
                return Ok(None);
            }
            let payload_len =
                u16::from_be_bytes([self.buf[consumed], self.buf[consumed + 1]]) as usize;
            if self.buf.len() < consumed + 2 + payload_len {
                return Ok(None);
            }
            consumed += 2;
            let payload = Bytes::copy_from_slice(&self.buf[consumed..consumed + payload_len]);
            consumed += payload_len;
            Some(payload)
        } else {
            None
        };

        self.buf.advance(consumed);
        Ok(Some((
            FrameMeta {
                session_id,
                status,
                option,
                network,
                target,
                global_id,
            },
            payload,
        )))
    }
}

/// Process-wide key for XUDP GlobalID derivation
static BASE_KEY: Lazy<[u8; 32]> = Lazy::new(rand::random);

/// `BLAKE3-keyed(base_key, "udp:" + host + ":" + port)[0..8]`
pub fn global_id(src_host: &str, src_port: u16) -> [u8; 8] {
    global_id_with_key(&BASE_KEY, src_host, src_port)
}

pub fn global_id_with_key(key: &[u8; 32], src_host: &str, src_port: u16) -> [u8; 8] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(format!("udp:{}:{}", src_host, src_port).as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);
    id
}

struct WriteOp {
    frame: Bytes,
    done: oneshot::Sender<Result<()>>,
}

struct SessionEntry {
    data: mpsc::Sender<Bytes>,
}

struct ClientInner {
    /// Taken on close so the writer task drains and exits
    write_tx: Mutex<Option<mpsc::Sender<WriteOp>>>,
    sessions: Mutex<HashMap<u16, SessionEntry>>,
    next_id: AtomicU16,
    closed: AtomicBool,
    full: AtomicBool,
    xudp: bool,
    empty_since: Mutex<Option<Instant>>,
}

impl ClientInner {
    async fn submit(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let sender = self
            .write_tx
            .lock()
            .clone()
            .ok_or(Error::NotConnected)?;
        let (done, wait) = oneshot::channel();
        sender
            .send(WriteOp { frame, done })
            .await
            .map_err(|_| Error::NotConnected)?;
        wait.await.map_err(|_| Error::NotConnected)?
    }

    fn remove_session(&self, id: u16) {
        let mut sessions = self.sessions.lock();
        sessions.remove(&id);
        if sessions.is_empty() {
            *self.empty_since.lock() = Some(Instant::now());
        }
    }

    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.sessions.lock().clear();
        self.write_tx.lock().take();
    }
}

/// Mux client over one outer VLESS-TCP connection
#[derive(Clone)]
pub struct MuxClient {
    inner: Arc<ClientInner>,
}

impl MuxClient {
    /// Take ownership of the established outer connection and start the
    /// writer/reader/idle tasks.
    pub fn new(outer: Stream, xudp: bool) -> Self {
        let (write_tx, mut write_rx) = mpsc::channel::<WriteOp>(64);
        let (mut outer_tx, mut outer_rx) = outer.into_split();

        let inner = Arc::new(ClientInner {
            write_tx: Mutex::new(Some(write_tx)),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(1),
            closed: AtomicBool::new(false),
            full: AtomicBool::new(false),
            xudp,
            empty_since: Mutex::new(Some(Instant::now())),
        });

        // Write serializer: one frame in flight, completions in order
        let writer_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(op) = write_rx.recv().await {
                let result = outer_tx.send(op.frame).await;
                let failed = result.is_err();
                let _ = op.done.send(result);
                if failed {
                    writer_inner.close_all();
                    // Fail everything still queued
                    while let Ok(op) = write_rx.try_recv() {
                        let _ = op.done.send(Err(Error::NotConnected));
                    }
                    break;
                }
            }
            outer_tx.close().await;
        });

        // Receive demultiplexer
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut parser = FrameParser::new();
            loop {
                match outer_rx.receive().await {
                    Ok(Some(chunk)) => {
                        parser.push(&chunk);
                        loop {
                            match parser.next_frame() {
                                Ok(Some((meta, payload))) => {
                                    dispatch(&reader_inner, meta, payload).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Mux frame error: {}", e);
                                    reader_inner.close_all();
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("Mux outer connection EOF");
                        reader_inner.close_all();
                        return;
                    }
                    Err(e) => {
                        if !e.is_silent() {
                            debug!("Mux outer read error: {}", e);
                        }
                        reader_inner.close_all();
                        return;
                    }
                }
            }
        });

        // Idle reaper: a client with zero sessions for 16 s closes itself
        let idle_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if idle_inner.closed.load(Ordering::Acquire) {
                    return;
                }
                let idle = {
                    let empty_since = idle_inner.empty_since.lock();
                    matches!(*empty_since, Some(t) if t.elapsed() >= IDLE_TIMEOUT)
                };
                if idle {
                    debug!("Mux client idle, closing");
                    idle_inner.close_all();
                    return;
                }
            }
        });

        MuxClient { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// An XUDP client carries exactly one session for its whole life
    pub fn is_full(&self) -> bool {
        self.inner.full.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    fn allocate_id(&self) -> u16 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
            // Counter wrapped; 0 stays reserved
        }
    }

    fn register(&self, id: u16) -> mpsc::Receiver<Bytes> {
        let (data_tx, data_rx) = mpsc::channel(SESSION_QUEUE);
        let mut sessions = self.inner.sessions.lock();
        sessions.insert(id, SessionEntry { data: data_tx });
        *self.inner.empty_since.lock() = None;
        data_rx
    }

    /// Open a TCP sub-stream to `target`
    pub async fn open_tcp(&self, target: Address) -> Result<MuxSession> {
        if self.is_closed() || self.is_full() {
            return Err(Error::NotConnected);
        }
        let id = self.allocate_id();
        let data_rx = self.register(id);

        let meta = FrameMeta {
            session_id: id,
            status: STATUS_NEW,
            option: 0,
            network: NETWORK_TCP,
            target: Some(target.clone()),
            global_id: None,
        };
        if let Err(e) = self.inner.submit(encode_frame(&meta, None)).await {
            self.inner.remove_session(id);
            return Err(e);
        }
        Ok(MuxSession {
            tx: MuxSessionTx {
                id,
                network: Network::Tcp,
                target,
                client: Arc::downgrade(&self.inner),
                closed: false,
            },
            rx: MuxSessionRx { data_rx },
        })
    }

    /// Open a UDP sub-stream. An XUDP client dedicates itself to this one
    /// session (id 0) and attaches the flow's GlobalID to the `new` frame.
    pub async fn open_udp(&self, target: Address, source: Option<(String, u16)>) -> Result<MuxSession> {
        if self.is_closed() || self.is_full() {
            return Err(Error::NotConnected);
        }
        let (id, global) = if self.inner.xudp {
            self.inner.full.store(true, Ordering::Release);
            let global = source.map(|(host, port)| global_id(&host, port));
            (0u16, global)
        } else {
            (self.allocate_id(), None)
        };
        let data_rx = self.register(id);

        let meta = FrameMeta {
            session_id: id,
            status: STATUS_NEW,
            option: 0,
            network: NETWORK_UDP,
            target: Some(target.clone()),
            global_id: global,
        };
        if let Err(e) = self.inner.submit(encode_frame(&meta, None)).await {
            self.inner.remove_session(id);
            return Err(e);
        }
        Ok(MuxSession {
            tx: MuxSessionTx {
                id,
                network: Network::Udp,
                target,
                client: Arc::downgrade(&self.inner),
                closed: false,
            },
            rx: MuxSessionRx { data_rx },
        })
    }
}

async fn dispatch(inner: &Arc<ClientInner>, meta: FrameMeta, payload: Option<Bytes>) {
    match meta.status {
        STATUS_KEEP => {
            if let Some(payload) = payload {
                // Snapshot the sender so the lock is not held across await
                let sender = inner
                    .sessions
                    .lock()
                    .get(&meta.session_id)
                    .map(|entry| entry.data.clone());
                match sender {
                    Some(sender) => {
                        let _ = sender.send(payload).await;
                    }
                    None => {
                        debug!("Mux keep for unknown session {}", meta.session_id);
                    }
                }
            }
        }
        STATUS_END => {
            inner.remove_session(meta.session_id);
        }
        STATUS_KEEPALIVE => {}
        STATUS_NEW => {
            // Server-initiated sessions are not a client concept
            debug!("Ignoring mux new from server, id {}", meta.session_id);
        }
        other => {
            warn!("Unknown mux status {}", other);
        }
    }
}

/// One logical sub-stream, composed of independent halves so a flow task
/// can select over send and receive concurrently.
pub struct MuxSession {
    pub tx: MuxSessionTx,
    pub rx: MuxSessionRx,
}

impl MuxSession {
    pub fn id(&self) -> u16 {
        self.tx.id
    }

    pub fn split(self) -> (MuxSessionTx, MuxSessionRx) {
        (self.tx, self.rx)
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.tx.send(data).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn close(&mut self) {
        self.tx.close().await;
    }
}

/// Send half; removes the table entry when dropped or closed
pub struct MuxSessionTx {
    id: u16,
    network: Network,
    target: Address,
    client: std::sync::Weak<ClientInner>,
    closed: bool,
}

impl MuxSessionTx {
    /// Send one chunk (TCP) or datagram (UDP). UDP keep frames repeat the
    /// address block; TCP keep frames do not.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let inner = self.client.upgrade().ok_or(Error::NotConnected)?;
        let meta = match self.network {
            Network::Tcp => FrameMeta::bare(self.id, STATUS_KEEP, OPTION_DATA),
            Network::Udp => FrameMeta {
                session_id: self.id,
                status: STATUS_KEEP,
                option: OPTION_DATA,
                network: NETWORK_UDP,
                target: Some(self.target.clone()),
                global_id: None,
            },
        };
        inner.submit(encode_frame(&meta, Some(data))).await
    }

    /// Send the end frame and drop the table entry
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(inner) = self.client.upgrade() {
            let meta = FrameMeta::bare(self.id, STATUS_END, 0);
            let _ = inner.submit(encode_frame(&meta, None)).await;
            inner.remove_session(self.id);
        }
    }
}

impl Drop for MuxSessionTx {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(inner) = self.client.upgrade() {
                inner.remove_session(self.id);
            }
        }
    }
}

/// Receive half
pub struct MuxSessionRx {
    data_rx: mpsc::Receiver<Bytes>,
}

impl MuxSessionRx {
    /// Next chunk/datagram from the remote; `None` when the session or the
    /// whole client has gone away.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.data_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing;

    fn addr(host: &str, port: u16) -> Address {
        Address::new(host, port).unwrap()
    }

    #[test]
    fn test_frame_roundtrip_all_statuses() {
        let frames = vec![
            (
                FrameMeta {
                    session_id: 1,
                    status: STATUS_NEW,
                    option: 0,
                    network: NETWORK_TCP,
                    target: Some(addr("example.com", 443)),
                    global_id: None,
                },
                None,
            ),
            (
                FrameMeta {
                    session_id: 2,
                    status: STATUS_NEW,
                    option: 0,
                    network: NETWORK_UDP,
                    target: Some(addr("1.1.1.1", 53)),
                    global_id: Some([9u8; 8]),
                },
                None,
            ),
            (
                FrameMeta::bare(1, STATUS_KEEP, OPTION_DATA),
                Some(Bytes::from_static(b"payload")),
            ),
            (
                FrameMeta {
                    session_id: 2,
                    status: STATUS_KEEP,
                    option: OPTION_DATA,
                    network: NETWORK_UDP,
                    target: Some(addr("1.1.1.1", 53)),
                    global_id: None,
                },
                Some(Bytes::from_static(b"datagram")),
            ),
            (FrameMeta::bare(1, STATUS_END, 0), None),
            (FrameMeta::bare(0, STATUS_KEEPALIVE, 0), None),
        ];

        // Encode everything, then decode from arbitrary splits
        let mut wire = BytesMut::new();
        for (meta, payload) in &frames {
            wire.put_slice(&encode_frame(meta, payload.as_deref()));
        }

        for split in [1usize, 3, 7, wire.len()] {
            let mut parser = FrameParser::new();
            let mut decoded = Vec::new();
            for chunk in wire.chunks(split) {
                parser.push(chunk);
                while let Some(frame) = parser.next_frame().unwrap() {
                    decoded.push(frame);
                }
            }
            assert_eq!(decoded.len(), frames.len(), "split {}", split);
            for ((meta, payload), (got_meta, got_payload)) in frames.iter().zip(decoded.iter()) {
                assert_eq!(meta, got_meta);
                assert_eq!(payload.as_deref(), got_payload.as_deref());
            }
        }
    }

    #[test]
    fn test_global_id_stable_per_key() {
        let key = [3u8; 32];
        let a = global_id_with_key(&key, "10.8.0.2", 50000);
        let b = global_id_with_key(&key, "10.8.0.2", 50000);
        assert_eq!(a, b);
        assert_ne!(a, global_id_with_key(&key, "10.8.0.2", 50001));
        assert_ne!(a, global_id_with_key(&[4u8; 32], "10.8.0.2", 50000));
    }

    #[tokio::test]
    async fn test_two_session_demux_single_chunk() {
        // Two keep frames for different sessions arriving as one chunk
        let (near, mut far) = testing::pair();
        let client = MuxClient::new(near, false);

        let mut s1 = client.open_tcp(addr("a.example.com", 80)).await.unwrap();
        let mut s2 = client.open_tcp(addr("b.example.com", 80)).await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 2);
        // Drain the two `new` frames
        let _ = far.receive().await.unwrap().unwrap();
        let _ = far.receive().await.unwrap().unwrap();

        let mut wire = BytesMut::new();
        wire.put_slice(&encode_frame(
            &FrameMeta::bare(1, STATUS_KEEP, OPTION_DATA),
            Some(b"A"),
        ));
        wire.put_slice(&encode_frame(
            &FrameMeta::bare(2, STATUS_KEEP, OPTION_DATA),
            Some(b"BB"),
        ));
        far.send(wire.freeze()).await.unwrap();

        assert_eq!(s1.recv().await.unwrap(), "A");
        assert_eq!(s2.recv().await.unwrap(), "BB");

        // Exactly once: no further deliveries pending
        assert!(tokio::time::timeout(Duration::from_millis(50), s1.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_end_frame_closes_session() {
        let (near, mut far) = testing::pair();
        let client = MuxClient::new(near, false);
        let mut session = client.open_tcp(addr("x.example.com", 80)).await.unwrap();
        let _ = far.receive().await.unwrap().unwrap();

        far.send(encode_frame(&FrameMeta::bare(session.id(), STATUS_END, 0), None))
            .await
            .unwrap();

        assert!(session.recv().await.is_none());
        assert_eq!(client.session_count(), 0);
    }

    #[tokio::test]
    async fn test_frames_do_not_interleave() {
        let (near, mut far) = testing::pair();
        let client = MuxClient::new(near, false);
        let session = client.open_tcp(addr("x.example.com", 80)).await.unwrap();
        let _ = far.receive().await.unwrap().unwrap();

        // Concurrent sends; each arriving chunk must parse as whole frames
        let s = Arc::new(session);
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                s.send(&vec![i; 100]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut parser = FrameParser::new();
        let mut seen = 0;
        while seen < 8 {
            let chunk = far.receive().await.unwrap().unwrap();
            parser.push(&chunk);
            while let Some((meta, payload)) = parser.next_frame().unwrap() {
                assert_eq!(meta.status, STATUS_KEEP);
                let payload = payload.unwrap();
                assert_eq!(payload.len(), 100);
                assert!(payload.iter().all(|b| *b == payload[0]));
                seen += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_xudp_client_is_single_session() {
        let (near, mut far) = testing::pair();
        let client = MuxClient::new(near, true);
        let session = client
            .open_udp(addr("8.8.8.8", 53), Some(("10.8.0.2".to_string(), 40000)))
            .await
            .unwrap();
        assert_eq!(session.id(), 0);
        assert!(client.is_full());
        assert!(client.open_tcp(addr("x.example.com", 80)).await.is_err());

        // The new frame carries network UDP and an 8-byte global id
        let wire = far.receive().await.unwrap().unwrap();
        let mut parser = FrameParser::new();
        parser.push(&wire);
        let (meta, payload) = parser.next_frame().unwrap().unwrap();
        assert_eq!(meta.status, STATUS_NEW);
        assert_eq!(meta.network, NETWORK_UDP);
        assert!(meta.global_id.is_some());
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn test_udp_keep_carries_address() {
        let (near, mut far) = testing::pair();
        let client = MuxClient::new(near, false);
        let session = client
            .open_udp(addr("9.9.9.9", 443), None)
            .await
            .unwrap();
        let _ = far.receive().await.unwrap().unwrap();

        session.send(b"dgram").await.unwrap();
        let wire = far.receive().await.unwrap().unwrap();
        let mut parser = FrameParser::new();
        parser.push(&wire);
        let (meta, payload) = parser.next_frame().unwrap().unwrap();
        assert_eq!(meta.status, STATUS_KEEP);
        assert_eq!(meta.network, NETWORK_UDP);
        assert_eq!(meta.target, Some(addr("9.9.9.9", 443)));
        assert_eq!(payload.unwrap(), "dgram");
    }
}
