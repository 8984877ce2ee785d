//! HTTP-Upgrade transport
//!
//! A WebSocket-flavored `GET` + `101` exchange after which the connection is
//! raw TCP passthrough with no framing.

use super::{read_until_header_end, PrefixedRx, Stream};
use crate::config::HttpUpgradeConfig;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use tracing::debug;

const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Perform the upgrade; bytes past the response header terminator are
/// preserved for the first receive.
pub async fn connect(inner: Stream, host: &str, cfg: &HttpUpgradeConfig) -> Result<Stream> {
    let (mut tx, mut rx) = inner.into_split();

    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n",
        cfg.path, host
    );
    for (key, value) in &cfg.headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str("\r\n");

    tx.send(Bytes::from(request.into_bytes()))
        .await
        .map_err(|e| Error::upgrade(format!("Upgrade request: {}", e)))?;

    let mut buf = BytesMut::new();
    let header_end = read_until_header_end(&mut buf, &mut rx, MAX_RESPONSE_HEADER).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf[..header_end])
        .map_err(|e| Error::upgrade(format!("Malformed upgrade response: {}", e)))?;
    if response.code != Some(101) {
        return Err(Error::upgrade(format!(
            "HTTP upgrade failed: status {:?}",
            response.code
        )));
    }

    let header_value = |name: &str| {
        response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_lowercase())
    };
    if header_value("upgrade").as_deref() != Some("websocket") {
        return Err(Error::upgrade("Missing Upgrade: websocket in response"));
    }
    if header_value("connection").as_deref() != Some("upgrade") {
        return Err(Error::upgrade("Missing Connection: upgrade in response"));
    }

    debug!("HTTP upgrade completed");

    let leftover = Bytes::copy_from_slice(&buf[header_end..]);
    Ok(Stream::new(tx, Box::new(PrefixedRx::new(leftover, rx))))
}
