//! TLS 1.3 client handshake and protected stream halves
//!
//! The driver speaks the standard handshake; Reality reuses it
//! with a caller-built session id and certificate validation disabled.

use super::fingerprint::{build_client_hello, ClientHelloParams, GROUP_X25519};
use super::key_schedule::{
    application_secrets, finished_verify, handshake_secrets, traffic_keys, Transcript,
};
use super::record::{RecordDecrypter, RecordEncrypter, HEADER_LEN, MAX_PLAINTEXT};
use super::{
    alert_error, Suite, CONTENT_ALERT, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC,
    CONTENT_HANDSHAKE, HS_CERTIFICATE, HS_CERTIFICATE_VERIFY, HS_ENCRYPTED_EXTENSIONS,
    HS_FINISHED, HS_SERVER_HELLO,
};
use crate::config::Fingerprint;
use crate::transport::{BoxRx, BoxTx, Stream, TlsVersion, TransportRx, TransportTx};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use aws_lc_rs::signature::{self, UnparsedPublicKey};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;
use std::sync::{Arc, OnceLock};
use subtle::ConstantTimeEq;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

/// Public options for the standard client
pub struct TlsOptions {
    pub server_name: String,
    pub alpn: Option<Vec<String>>,
    pub fingerprint: Fingerprint,
    pub allow_insecure: bool,
}

/// Internal handshake inputs; Reality supplies its own randomness and
/// session id and switches validation off.
pub(crate) struct HandshakeParams {
    pub server_name: String,
    pub alpn: Option<Vec<String>>,
    pub fingerprint: Fingerprint,
    pub random: [u8; 32],
    pub session_id: [u8; 32],
    pub secret: StaticSecret,
    pub validate_certs: bool,
    /// Surface AEAD failures on application records as
    /// [`Error::Decryption`] with the raw bytes (Reality / Vision contract).
    pub reality_signal: bool,
}

/// Standard TLS 1.3 handshake over `inner`
pub async fn connect(inner: Stream, opts: &TlsOptions) -> Result<Stream> {
    let params = HandshakeParams {
        server_name: opts.server_name.clone(),
        alpn: opts.alpn.clone(),
        fingerprint: opts.fingerprint,
        random: rand::random(),
        session_id: rand::random(),
        secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        validate_certs: !opts.allow_insecure,
        reality_signal: false,
    };
    handshake(inner, params).await
}

/// Drive the handshake to completion and return the protected stream.
pub(crate) async fn handshake(inner: Stream, params: HandshakeParams) -> Result<Stream> {
    let (mut tx, rx) = inner.into_split();

    let public = PublicKey::from(&params.secret);
    let hello = build_client_hello(&ClientHelloParams {
        fingerprint: params.fingerprint,
        random: params.random,
        session_id: params.session_id,
        server_name: &params.server_name,
        key_share: public.to_bytes(),
        alpn: params.alpn.as_deref(),
    })?;

    // First flight rides a legacy 0x0301 record
    let mut flight = Vec::with_capacity(hello.len() + HEADER_LEN);
    flight.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x01]);
    flight.extend_from_slice(&(hello.len() as u16).to_be_bytes());
    flight.extend_from_slice(&hello);
    tx.send(Bytes::from(flight))
        .await
        .map_err(|e| Error::handshake(format!("ClientHello send: {}", e)))?;

    let mut reader = RecordReader::new(rx);

    // ServerHello
    let mut plaintext_hs = Vec::new();
    let server_hello = loop {
        if let Some(message) = take_handshake_message(&mut plaintext_hs)? {
            break message;
        }
        let (content_type, record) = reader.next().await?;
        match content_type {
            CONTENT_HANDSHAKE => plaintext_hs.extend_from_slice(&record[HEADER_LEN..]),
            CONTENT_CHANGE_CIPHER_SPEC => continue,
            CONTENT_ALERT => return Err(alert_error(&record[HEADER_LEN..])),
            other => {
                return Err(Error::handshake(format!(
                    "Unexpected record before ServerHello: 0x{:02x}",
                    other
                )))
            }
        }
    };

    let sh = parse_server_hello(&server_hello)?;
    let suite = Suite::from_id(sh.cipher_suite)?;
    debug!(
        "ServerHello: suite=0x{:04x}, key share {} bytes",
        sh.cipher_suite,
        sh.key_share.len()
    );

    let mut transcript = Transcript::new(suite.hash);
    transcript.update(&hello);
    transcript.update(&server_hello);

    let server_public = PublicKey::from(sh.key_share);
    let shared = params.secret.diffie_hellman(&server_public);

    let secrets = handshake_secrets(suite, shared.as_bytes(), &transcript.digest())?;
    let mut encrypter = RecordEncrypter::new(suite, &traffic_keys(suite, &secrets.client_traffic)?)?;
    let mut decrypter = RecordDecrypter::new(suite, &traffic_keys(suite, &secrets.server_traffic)?)?;

    // Encrypted handshake flight
    let mut hs_stream: Vec<u8> = plaintext_hs;
    let mut certificates: Vec<Vec<u8>> = Vec::new();
    let mut cert_verify: Option<(u16, Vec<u8>, Vec<u8>)> = None; // alg, sig, transcript hash
    loop {
        if let Some(message) = take_handshake_message(&mut hs_stream)? {
            match message[0] {
                HS_ENCRYPTED_EXTENSIONS => transcript.update(&message),
                HS_CERTIFICATE => {
                    certificates = parse_certificate_list(&message)?;
                    transcript.update(&message);
                }
                HS_CERTIFICATE_VERIFY => {
                    // The signature covers the transcript before this message
                    let checkpoint = transcript.digest();
                    let (alg, sig) = parse_certificate_verify(&message)?;
                    cert_verify = Some((alg, sig, checkpoint));
                    transcript.update(&message);
                }
                HS_FINISHED => {
                    let expected =
                        finished_verify(suite.hash, &secrets.server_traffic, &transcript.digest())?;
                    let received = &message[4..];
                    if expected.ct_eq(received).unwrap_u8() != 1 {
                        return Err(Error::handshake("Server Finished verify failed"));
                    }
                    transcript.update(&message);
                    break;
                }
                other => {
                    debug!("Skipping handshake message 0x{:02x}", other);
                    transcript.update(&message);
                }
            }
            continue;
        }

        let (content_type, record) = reader.next().await?;
        match content_type {
            CONTENT_APPLICATION_DATA => {
                let (inner_type, data) = decrypter.open(&record)?;
                match inner_type {
                    CONTENT_HANDSHAKE => hs_stream.extend_from_slice(&data),
                    CONTENT_ALERT => return Err(alert_error(&data)),
                    other => {
                        return Err(Error::handshake(format!(
                            "Unexpected inner type during handshake: 0x{:02x}",
                            other
                        )))
                    }
                }
            }
            CONTENT_CHANGE_CIPHER_SPEC => continue,
            CONTENT_ALERT => return Err(alert_error(&record[HEADER_LEN..])),
            other => {
                return Err(Error::handshake(format!(
                    "Unexpected record during handshake: 0x{:02x}",
                    other
                )))
            }
        }
    }

    if params.validate_certs {
        let (alg, sig, checkpoint) = cert_verify
            .ok_or_else(|| Error::handshake("Server omitted CertificateVerify"))?;
        validate_server(&params.server_name, &certificates, alg, &sig, &checkpoint)?;
    }

    // Application keys derive from the transcript through Server Finished
    let app = application_secrets(suite, &secrets.handshake_secret, &transcript.digest())?;

    // ChangeCipherSpec + client Finished (seq 0 on the handshake key)
    let client_verify = finished_verify(suite.hash, &secrets.client_traffic, &transcript.digest())?;
    let mut finished_msg = Vec::with_capacity(client_verify.len() + 4);
    finished_msg.push(HS_FINISHED);
    finished_msg.extend_from_slice(&(client_verify.len() as u32).to_be_bytes()[1..]);
    finished_msg.extend_from_slice(&client_verify);
    let finished_record = encrypter.encrypt(&finished_msg, CONTENT_HANDSHAKE)?;

    let mut flight = Vec::with_capacity(finished_record.len() + 6);
    flight.extend_from_slice(&[CONTENT_CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01]);
    flight.extend_from_slice(&finished_record);
    tx.send(Bytes::from(flight))
        .await
        .map_err(|e| Error::handshake(format!("Finished send: {}", e)))?;

    debug!("TLS 1.3 handshake complete with {}", params.server_name);

    let app_encrypter = RecordEncrypter::new(suite, &traffic_keys(suite, &app.client_traffic)?)?;
    let app_decrypter = RecordDecrypter::new(suite, &traffic_keys(suite, &app.server_traffic)?)?;
    let (rx, leftover) = reader.into_parts();

    Ok(Stream::new(
        Box::new(TlsTx {
            inner: tx,
            encrypter: app_encrypter,
        }),
        Box::new(TlsRx {
            inner: rx,
            buf: leftover,
            decrypter: app_decrypter,
            reality_signal: params.reality_signal,
        }),
    )
    .with_tls_version(TlsVersion::Tls13))
}

/// Buffers inner-rx bytes and yields whole TLS records
struct RecordReader {
    rx: BoxRx,
    buf: BytesMut,
}

impl RecordReader {
    fn new(rx: BoxRx) -> Self {
        RecordReader {
            rx,
            buf: BytesMut::new(),
        }
    }

    async fn next(&mut self) -> Result<(u8, Bytes)> {
        loop {
            if let Some(len) = record_len(&self.buf) {
                let record = self.buf.split_to(len).freeze();
                return Ok((record[0], record));
            }
            match self.rx.receive().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => return Err(Error::handshake("EOF during TLS handshake")),
            }
        }
    }

    fn into_parts(self) -> (BoxRx, BytesMut) {
        (self.rx, self.buf)
    }
}

fn record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < HEADER_LEN + len {
        return None;
    }
    Some(HEADER_LEN + len)
}

/// Pop one complete handshake message (header included) off `stream`
fn take_handshake_message(stream: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    if stream.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([0, stream[1], stream[2], stream[3]]) as usize;
    if stream.len() < 4 + len {
        return Ok(None);
    }
    let message = stream.drain(..4 + len).collect();
    Ok(Some(message))
}

struct ParsedServerHello {
    cipher_suite: u16,
    key_share: [u8; 32],
}

fn parse_server_hello(message: &[u8]) -> Result<ParsedServerHello> {
    if message.first() != Some(&HS_SERVER_HELLO) {
        return Err(Error::handshake(format!(
            "Expected ServerHello, got 0x{:02x}",
            message.first().copied().unwrap_or(0)
        )));
    }
    // header(4) + version(2) + random(32)
    let mut offset = 4 + 2 + 32;
    let sid_len = *message
        .get(offset)
        .ok_or_else(|| Error::handshake("Truncated ServerHello"))? as usize;
    offset += 1 + sid_len;

    let need = |n: usize| {
        if message.len() < n {
            Err(Error::handshake("Truncated ServerHello"))
        } else {
            Ok(())
        }
    };
    need(offset + 3)?;
    let cipher_suite = u16::from_be_bytes([message[offset], message[offset + 1]]);
    offset += 3; // suite + compression

    need(offset + 2)?;
    let ext_total = u16::from_be_bytes([message[offset], message[offset + 1]]) as usize;
    offset += 2;
    need(offset + ext_total)?;

    let mut key_share = None;
    let end = offset + ext_total;
    while offset + 4 <= end {
        let typ = u16::from_be_bytes([message[offset], message[offset + 1]]);
        let len = u16::from_be_bytes([message[offset + 2], message[offset + 3]]) as usize;
        offset += 4;
        if typ == super::fingerprint::EXT_KEY_SHARE && len >= 4 {
            let group = u16::from_be_bytes([message[offset], message[offset + 1]]);
            let klen = u16::from_be_bytes([message[offset + 2], message[offset + 3]]) as usize;
            if group == GROUP_X25519 && klen == 32 && len >= 4 + 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&message[offset + 4..offset + 36]);
                key_share = Some(key);
            }
        }
        offset += len;
    }

    Ok(ParsedServerHello {
        cipher_suite,
        key_share: key_share
            .ok_or_else(|| Error::handshake("ServerHello without X25519 key share"))?,
    })
}

/// TLS 1.3 Certificate: context length, then a 3-byte list of
/// (3-byte DER length, DER, 2-byte extensions).
fn parse_certificate_list(message: &[u8]) -> Result<Vec<Vec<u8>>> {
    let body = &message[4..];
    if body.is_empty() {
        return Err(Error::handshake("Empty Certificate message"));
    }
    let context_len = body[0] as usize;
    let mut offset = 1 + context_len;
    if body.len() < offset + 3 {
        return Err(Error::handshake("Truncated Certificate message"));
    }
    let list_len = u32::from_be_bytes([0, body[offset], body[offset + 1], body[offset + 2]]) as usize;
    offset += 3;
    let end = offset + list_len;
    if body.len() < end {
        return Err(Error::handshake("Truncated certificate list"));
    }

    let mut certs = Vec::new();
    while offset + 3 <= end {
        let cert_len =
            u32::from_be_bytes([0, body[offset], body[offset + 1], body[offset + 2]]) as usize;
        offset += 3;
        if end < offset + cert_len + 2 {
            return Err(Error::handshake("Truncated certificate entry"));
        }
        certs.push(body[offset..offset + cert_len].to_vec());
        offset += cert_len;
        let ext_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
        offset += 2 + ext_len;
    }
    Ok(certs)
}

fn parse_certificate_verify(message: &[u8]) -> Result<(u16, Vec<u8>)> {
    let body = &message[4..];
    if body.len() < 4 {
        return Err(Error::handshake("Truncated CertificateVerify"));
    }
    let alg = u16::from_be_bytes([body[0], body[1]]);
    let sig_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    if body.len() < 4 + sig_len {
        return Err(Error::handshake("Truncated CertificateVerify signature"));
    }
    Ok((alg, body[4..4 + sig_len].to_vec()))
}

/// Trust anchors evaluated through rustls/webpki; built once per process.
fn webpki_verifier() -> Result<Arc<WebPkiServerVerifier>> {
    static VERIFIER: OnceLock<Arc<WebPkiServerVerifier>> = OnceLock::new();
    if let Some(verifier) = VERIFIER.get() {
        return Ok(verifier.clone());
    }
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let verifier = WebPkiServerVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
    )
    .build()
    .map_err(|e| Error::setup(format!("Verifier build: {}", e)))?;
    Ok(VERIFIER.get_or_init(|| verifier).clone())
}

/// Chain evaluation plus the CertificateVerify signature over
/// the transcript checkpoint.
fn validate_server(
    server_name: &str,
    certificates: &[Vec<u8>],
    sig_alg: u16,
    signature: &[u8],
    transcript_hash: &[u8],
) -> Result<()> {
    let end_entity = certificates
        .first()
        .ok_or_else(|| Error::certificate("Server sent no certificates"))?;
    let end_entity = CertificateDer::from(end_entity.clone());
    let intermediates: Vec<CertificateDer<'static>> = certificates[1..]
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| Error::certificate(format!("Bad server name: {}", server_name)))?;

    let verifier = webpki_verifier()?;
    verifier
        .verify_server_cert(&end_entity, &intermediates, &name, &[], UnixTime::now())
        .map_err(|e| Error::certificate(e.to_string()))?;

    let algorithm: &'static dyn signature::VerificationAlgorithm = match sig_alg {
        0x0403 => &signature::ECDSA_P256_SHA256_ASN1,
        0x0503 => &signature::ECDSA_P384_SHA384_ASN1,
        0x0603 => &signature::ECDSA_P521_SHA512_ASN1,
        0x0804 => &signature::RSA_PSS_2048_8192_SHA256,
        0x0805 => &signature::RSA_PSS_2048_8192_SHA384,
        0x0806 => &signature::RSA_PSS_2048_8192_SHA512,
        0x0401 => &signature::RSA_PKCS1_2048_8192_SHA256,
        other => {
            return Err(Error::handshake(format!(
                "Unsupported signature algorithm: 0x{:04x}",
                other
            )))
        }
    };

    // 64 spaces, context string, separator, transcript hash
    let mut signed = Vec::with_capacity(98 + transcript_hash.len());
    signed.extend_from_slice(&[0x20u8; 64]);
    signed.extend_from_slice(b"TLS 1.3, server CertificateVerify");
    signed.push(0x00);
    signed.extend_from_slice(transcript_hash);

    let leaf_key = super::x509::subject_public_key(certificates[0].as_slice())?;
    UnparsedPublicKey::new(algorithm, &leaf_key)
        .verify(&signed, signature)
        .map_err(|_| Error::certificate("CertificateVerify signature mismatch"))?;
    Ok(())
}

/// Protected write half
pub(crate) struct TlsTx {
    inner: BoxTx,
    encrypter: RecordEncrypter,
}

#[async_trait]
impl TransportTx for TlsTx {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let mut wire = Vec::with_capacity(data.len() + 64);
        for chunk in data.chunks(MAX_PLAINTEXT) {
            wire.extend_from_slice(&self.encrypter.encrypt(chunk, CONTENT_APPLICATION_DATA)?);
        }
        self.inner.send(Bytes::from(wire)).await
    }

    async fn send_direct(&mut self, data: Bytes) -> Result<()> {
        self.inner.send(data).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// Protected read half
pub(crate) struct TlsRx {
    inner: BoxRx,
    buf: BytesMut,
    decrypter: RecordDecrypter,
    reality_signal: bool,
}

#[async_trait]
impl TransportRx for TlsRx {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(len) = record_len(&self.buf) {
                let record = self.buf.split_to(len).freeze();
                match record[0] {
                    CONTENT_APPLICATION_DATA => {
                        let opened = self.decrypter.open(&record);
                        let (inner_type, data) = match opened {
                            Ok(pair) => pair,
                            Err(e) => {
                                if self.reality_signal {
                                    return Err(Error::Decryption(record));
                                }
                                return Err(e);
                            }
                        };
                        match inner_type {
                            CONTENT_APPLICATION_DATA => {
                                if data.is_empty() {
                                    continue;
                                }
                                return Ok(Some(Bytes::from(data)));
                            }
                            // Post-handshake messages (tickets, key updates)
                            CONTENT_HANDSHAKE => continue,
                            CONTENT_ALERT => {
                                if data.len() >= 2 && data[1] == 0 {
                                    return Ok(None); // close_notify
                                }
                                return Err(alert_error(&data));
                            }
                            other => {
                                return Err(Error::invalid_frame(format!(
                                    "Bad inner content type: 0x{:02x}",
                                    other
                                )))
                            }
                        }
                    }
                    CONTENT_CHANGE_CIPHER_SPEC => continue,
                    CONTENT_ALERT => return Err(alert_error(&record[HEADER_LEN..])),
                    other => {
                        return Err(Error::invalid_frame(format!(
                            "Unexpected record type: 0x{:02x}",
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
                    return Err(Error::receive("EOF inside TLS record"));
                }
            }
        }
    }

    async fn receive_direct(&mut self) -> Result<Option<Bytes>> {
        if !self.buf.is_empty() {
            return Ok(Some(self.buf.split().freeze()));
        }
        self.inner.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_handshake_message() {
        let mut stream = vec![0x08, 0, 0, 2, 0xAA, 0xBB, 0x0B, 0, 0, 1];
        let msg = take_handshake_message(&mut stream).unwrap().unwrap();
        assert_eq!(msg, vec![0x08, 0, 0, 2, 0xAA, 0xBB]);
        // Second message is incomplete
        assert!(take_handshake_message(&mut stream).unwrap().is_none());
        stream.push(0xCC);
        let msg = take_handshake_message(&mut stream).unwrap().unwrap();
        assert_eq!(msg, vec![0x0B, 0, 0, 1, 0xCC]);
    }

    #[test]
    fn test_parse_server_hello() {
        // Minimal ServerHello: version, random, sid(0), suite 0x1301,
        // compression, extensions: key_share x25519
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[7u8; 32]);
        body.push(0); // sid len
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(0); // compression
        let mut ks = Vec::new();
        ks.extend_from_slice(&0x0033u16.to_be_bytes());
        ks.extend_from_slice(&36u16.to_be_bytes());
        ks.extend_from_slice(&0x001Du16.to_be_bytes());
        ks.extend_from_slice(&32u16.to_be_bytes());
        ks.extend_from_slice(&[5u8; 32]);
        body.extend_from_slice(&(ks.len() as u16).to_be_bytes());
        body.extend_from_slice(&ks);

        let mut message = vec![HS_SERVER_HELLO];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);

        let parsed = parse_server_hello(&message).unwrap();
        assert_eq!(parsed.cipher_suite, 0x1301);
        assert_eq!(parsed.key_share, [5u8; 32]);
    }

    #[test]
    fn test_parse_certificate_list() {
        // context(0), list of one cert [0xDE,0xAD] with no extensions
        let mut body = vec![0u8];
        body.extend_from_slice(&[0, 0, 7]); // list length
        body.extend_from_slice(&[0, 0, 2, 0xDE, 0xAD, 0, 0]);
        let mut message = vec![HS_CERTIFICATE];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);

        let certs = parse_certificate_list(&message).unwrap();
        assert_eq!(certs, vec![vec![0xDE, 0xAD]]);
    }

    #[test]
    fn test_record_len() {
        assert_eq!(record_len(&[0x17, 3, 3, 0, 2, 0xAA, 0xBB]), Some(7));
        assert_eq!(record_len(&[0x17, 3, 3, 0, 2, 0xAA]), None);
        assert_eq!(record_len(&[0x17, 3, 3]), None);
    }
}
