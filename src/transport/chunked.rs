//! HTTP/1.1 chunked transfer coding
//!
//! The encoder frames one chunk per send; the decoder is buffered and only
//! yields whole chunks. Chunk extensions are ignored; size 0 marks
//! end-of-stream.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Frame one chunk: `hex(len)\r\n{bytes}\r\n`
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// The stream terminator (`0\r\n\r\n`)
pub fn terminator() -> Bytes {
    Bytes::from_static(b"0\r\n\r\n")
}

/// Buffered chunk decoder
#[derive(Default)]
pub struct ChunkedDecoder {
    buf: BytesMut,
    finished: bool,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// End-of-stream chunk seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next whole chunk body, or `None` when more input is needed or the
    /// stream has ended.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let header_end = match self.buf.windows(2).position(|w| w == b"\r\n") {
                Some(pos) => pos,
                None => return Ok(None),
            };

            let header = std::str::from_utf8(&self.buf[..header_end])
                .map_err(|_| Error::invalid_frame("Non-ASCII chunk header"))?;
            let size_str = header.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| Error::invalid_frame(format!("Bad chunk size: {:?}", size_str)))?;

            if size == 0 {
                self.finished = true;
                return Ok(None);
            }

            // header + CRLF + body + CRLF
            let total = header_end + 2 + size + 2;
            if self.buf.len() < total {
                return Ok(None);
            }

            let _ = self.buf.split_to(header_end + 2);
            let body = self.buf.split_to(size).freeze();
            let trailer = self.buf.split_to(2);
            if &trailer[..] != b"\r\n" {
                return Err(Error::invalid_frame("Missing CRLF after chunk body"));
            }
            if body.is_empty() {
                continue;
            }
            return Ok(Some(body));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(&encode_chunk(b"hello")[..], b"5\r\nhello\r\n");
        assert_eq!(&encode_chunk(&[0u8; 16])[..4], b"10\r\n");
    }

    #[test]
    fn test_roundtrip() {
        let payloads: [&[u8]; 3] = [b"alpha", b"bb", &[0xAA; 300]];
        let mut wire = BytesMut::new();
        for p in payloads {
            wire.extend_from_slice(&encode_chunk(p));
        }
        wire.extend_from_slice(&terminator());

        let mut decoder = ChunkedDecoder::new();
        decoder.push(&wire);
        for p in payloads {
            assert_eq!(&decoder.next_chunk().unwrap().unwrap()[..], p);
        }
        assert!(decoder.next_chunk().unwrap().is_none());
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_partial_feed_never_yields_incomplete() {
        let wire = encode_chunk(b"partial-chunk-data");
        let mut decoder = ChunkedDecoder::new();
        for (i, byte) in wire.iter().enumerate() {
            decoder.push(std::slice::from_ref(byte));
            let chunk = decoder.next_chunk().unwrap();
            if i < wire.len() - 1 {
                assert!(chunk.is_none(), "yielded early at byte {}", i);
            } else {
                assert_eq!(&chunk.unwrap()[..], b"partial-chunk-data");
            }
        }
    }

    #[test]
    fn test_extension_ignored() {
        let mut decoder = ChunkedDecoder::new();
        decoder.push(b"5;name=value\r\nhello\r\n");
        assert_eq!(&decoder.next_chunk().unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn test_bad_size_rejected() {
        let mut decoder = ChunkedDecoder::new();
        decoder.push(b"zz\r\nhello\r\n");
        assert!(decoder.next_chunk().is_err());
    }
}
