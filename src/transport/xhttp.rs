//! XHTTP transport, HTTP/1.1 modes
//!
//! `stream-one` runs a single chunked POST both ways. `packet-up` splits the
//! connection: one long GET download plus a series of sequenced POST uploads
//! opened on demand through a dial factory (CDN-friendly).

use super::chunked::{encode_chunk, ChunkedDecoder};
use super::{read_until_header_end, BoxRx, BoxTx, Stream, TransportRx, TransportTx};
use crate::config::XhttpConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// User agent when the configuration does not override it
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Factory for upload connections (packet-up opens them on demand)
pub type DialFuture = Pin<Box<dyn Future<Output = Result<Stream>> + Send>>;
pub type Dialer = Box<dyn Fn() -> DialFuture + Send + Sync>;

/// Random per-connection session id, hex
pub fn session_id() -> String {
    let raw: [u8; 8] = rand::random();
    hex::encode(raw)
}

/// `Referer` value with the anti-fingerprint query padding
pub fn padding_referer(host: &str, path_and_query: &str) -> String {
    let count = rand::thread_rng().gen_range(100..=1000);
    format!(
        "https://{}{}?x_padding={}",
        host,
        path_and_query,
        "X".repeat(count)
    )
}

fn user_agent(cfg: &XhttpConfig) -> &str {
    cfg.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
}

fn joined_path(path: &str, suffix: &str) -> String {
    format!("{}{}", path.trim_end_matches('/'), suffix)
}

/// Send `request`, read the response header, require the given status.
/// Returns the bytes read past the header terminator.
async fn exchange_header(
    tx: &mut BoxTx,
    rx: &mut BoxRx,
    request: String,
    body: Option<&[u8]>,
) -> Result<Bytes> {
    let mut wire = BytesMut::from(request.as_bytes());
    if let Some(body) = body {
        wire.extend_from_slice(body);
    }
    tx.send(wire.freeze())
        .await
        .map_err(|e| Error::http(format!("XHTTP request: {}", e)))?;

    let mut buf = BytesMut::new();
    let header_end = read_until_header_end(&mut buf, rx, MAX_RESPONSE_HEADER).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf[..header_end])
        .map_err(|e| Error::http(format!("Malformed XHTTP response: {}", e)))?;
    if response.code != Some(200) {
        return Err(Error::http(format!(
            "XHTTP response status {:?}",
            response.code
        )));
    }
    Ok(Bytes::copy_from_slice(&buf[header_end..]))
}

/// Rx half that feeds a chunked decoder from the inner half
pub(crate) struct ChunkedRx {
    inner: BoxRx,
    decoder: ChunkedDecoder,
}

impl ChunkedRx {
    pub(crate) fn new(inner: BoxRx, leftover: &[u8]) -> Self {
        let mut decoder = ChunkedDecoder::new();
        decoder.push(leftover);
        ChunkedRx { inner, decoder }
    }
}

#[async_trait]
impl TransportRx for ChunkedRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(chunk) = self.decoder.next_chunk()? {
                return Ok(Some(chunk));
            }
            if self.decoder.is_finished() {
                return Ok(None);
            }
            match self.inner.receive().await? {
                Some(data) => self.decoder.push(&data),
                None => return Ok(None),
            }
        }
    }
}

/// stream-one: a single `POST` with chunked transfer coding in both
/// directions, running until cancel.
pub async fn connect_stream_one(inner: Stream, host: &str, cfg: &XhttpConfig) -> Result<Stream> {
    let (mut tx, mut rx) = inner.into_split();

    let mut request = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Transfer-Encoding: chunked\r\n",
        cfg.path,
        host,
        user_agent(cfg)
    );
    if cfg.grpc_header {
        request.push_str("Content-Type: application/grpc\r\n");
    }
    for (key, value) in &cfg.headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str("\r\n");

    let leftover = exchange_header(&mut tx, &mut rx, request, None).await?;
    debug!("XHTTP stream-one established");

    Ok(Stream::new(
        Box::new(StreamOneTx { inner: tx }),
        Box::new(ChunkedRx::new(rx, &leftover)),
    ))
}

struct StreamOneTx {
    inner: BoxTx,
}

#[async_trait]
impl TransportTx for StreamOneTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.send(encode_chunk(&data)).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// packet-up: GET download plus sequenced POST uploads.
///
/// `download` is an established connection to the server; `dialer` opens
/// further connections for uploads on demand.
pub async fn connect_packet_up(
    download: Stream,
    dialer: Dialer,
    host: String,
    cfg: XhttpConfig,
) -> Result<Stream> {
    let sid = session_id();
    let (mut tx, mut rx) = download.into_split();

    let get_path = joined_path(&cfg.path, &format!("/{}/", sid));
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Referer: {}\r\n",
        get_path,
        host,
        user_agent(&cfg),
        padding_referer(&host, &get_path)
    );
    for (key, value) in &cfg.headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str("\r\n");

    let leftover = exchange_header(&mut tx, &mut rx, request, None).await?;
    debug!("XHTTP packet-up download established, session {}", sid);

    Ok(Stream::new(
        Box::new(PacketUpTx {
            dialer,
            host,
            cfg,
            session_id: sid,
            seq: 0,
            conn: None,
            last_post: None,
        }),
        Box::new(ChunkedRx::new(rx, &leftover)),
    ))
}

struct PacketUpTx {
    dialer: Dialer,
    host: String,
    cfg: XhttpConfig,
    session_id: String,
    seq: u64,
    /// Keep-alive upload connection, reused across POSTs
    conn: Option<Stream>,
    last_post: Option<Instant>,
}

impl PacketUpTx {
    async fn post(&mut self, body: &[u8]) -> Result<()> {
        if let Some(last) = self.last_post {
            let min_interval = Duration::from_millis(self.cfg.sc_min_posts_interval_ms);
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }

        let path = joined_path(&self.cfg.path, &format!("/{}/{}", self.session_id, self.seq));
        let referer_path = joined_path(&self.cfg.path, &format!("/{}/", self.session_id));
        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             User-Agent: {}\r\n\
             Referer: {}\r\n\
             Content-Length: {}\r\n\
             Connection: keep-alive\r\n",
            path,
            self.host,
            user_agent(&self.cfg),
            padding_referer(&self.host, &referer_path),
            body.len()
        );
        if self.cfg.grpc_header {
            request.push_str("Content-Type: application/grpc\r\n");
        }
        for (key, value) in &self.cfg.headers {
            request.push_str(&format!("{}: {}\r\n", key, value));
        }
        request.push_str("\r\n");

        // A failed keep-alive connection is dropped; the error propagates and
        // the next send dials anew.
        if self.conn.is_none() {
            self.conn = Some((self.dialer)().await?);
        }
        let conn = self.conn.as_mut().ok_or(Error::NotConnected)?;
        let (tx, rx) = conn.halves_mut();

        let result = exchange_header(tx, rx, request, Some(body)).await;
        match result {
            Ok(_) => {
                self.seq += 1;
                self.last_post = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TransportTx for PacketUpTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        // Oversize writes are split iteratively, one POST per piece.
        let max = self.cfg.sc_max_each_post_bytes.max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + max).min(data.len());
            self.post(&data[offset..end]).await?;
            offset = end;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }
}
