//! TLS 1.3 record protection (RFC 8446 §5.2)
//!
//! Per-direction sequence numbers start at zero and advance on every record,
//! including discarded ones; they reset when the direction re-keys from
//! handshake to application secrets (the caller builds fresh
//! encrypter/decrypter instances for that).

use super::key_schedule::TrafficKeys;
use super::{Suite, CONTENT_APPLICATION_DATA};
use crate::{Error, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};

/// AEAD tag length
pub const TAG_LEN: usize = 16;

/// Record header length
pub const HEADER_LEN: usize = 5;

/// Largest plaintext fragment we emit per record
pub const MAX_PLAINTEXT: usize = 16 * 1024;

/// Per-direction nonce: static IV XORed with the big-endian sequence number
/// packed into the last 8 bytes.
pub fn build_nonce(iv: &[u8; Suite::IV_LEN], seq: u64) -> [u8; Suite::IV_LEN] {
    let mut nonce = *iv;
    for (i, byte) in seq.to_be_bytes().iter().enumerate() {
        nonce[4 + i] ^= byte;
    }
    nonce
}

enum SuiteAead {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl SuiteAead {
    fn new(suite: Suite, key: &[u8]) -> Result<Self> {
        match suite.key_len {
            16 => Ok(SuiteAead::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|_| Error::handshake("Bad AES-128 key length"))?,
            ))),
            32 => Ok(SuiteAead::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|_| Error::handshake("Bad AES-256 key length"))?,
            ))),
            _ => Err(Error::handshake("Unsupported key length")),
        }
    }

    fn seal(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            SuiteAead::Aes128(aead) => aead.encrypt(Nonce::from_slice(nonce), payload),
            SuiteAead::Aes256(aead) => aead.encrypt(Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| Error::handshake("Record seal failed"))
    }

    fn open(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg, aad };
        match self {
            SuiteAead::Aes128(aead) => aead.decrypt(Nonce::from_slice(nonce), payload),
            SuiteAead::Aes256(aead) => aead.decrypt(Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| Error::receive("Record open failed"))
    }
}

/// Encrypting side of one direction
pub struct RecordEncrypter {
    aead: SuiteAead,
    iv: [u8; Suite::IV_LEN],
    seq: u64,
}

impl RecordEncrypter {
    pub fn new(suite: Suite, keys: &TrafficKeys) -> Result<Self> {
        Ok(RecordEncrypter {
            aead: SuiteAead::new(suite, &keys.key)?,
            iv: keys.iv,
            seq: 0,
        })
    }

    /// Seal `payload` with the given inner content type into a full record
    /// (header included).
    pub fn encrypt(&mut self, payload: &[u8], inner_type: u8) -> Result<Vec<u8>> {
        let mut inner = Vec::with_capacity(payload.len() + 1);
        inner.extend_from_slice(payload);
        inner.push(inner_type);

        let cipher_len = inner.len() + TAG_LEN;
        let header = [
            CONTENT_APPLICATION_DATA,
            0x03,
            0x03,
            (cipher_len >> 8) as u8,
            cipher_len as u8,
        ];

        let nonce = build_nonce(&self.iv, self.seq);
        let sealed = self.aead.seal(&nonce, &header, &inner)?;
        self.seq += 1;

        let mut record = Vec::with_capacity(HEADER_LEN + sealed.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&sealed);
        Ok(record)
    }
}

/// Decrypting side of one direction
pub struct RecordDecrypter {
    aead: SuiteAead,
    iv: [u8; Suite::IV_LEN],
    seq: u64,
}

impl RecordDecrypter {
    pub fn new(suite: Suite, keys: &TrafficKeys) -> Result<Self> {
        Ok(RecordDecrypter {
            aead: SuiteAead::new(suite, &keys.key)?,
            iv: keys.iv,
            seq: 0,
        })
    }

    /// Open one full record (header included). Returns the inner content
    /// type and payload; trailing zero padding is stripped. The counter
    /// advances on every successful open.
    pub fn open(&mut self, record: &[u8]) -> Result<(u8, Vec<u8>)> {
        if record.len() < HEADER_LEN + TAG_LEN {
            return Err(Error::invalid_frame("Record too short"));
        }
        let (header, ciphertext) = record.split_at(HEADER_LEN);

        let nonce = build_nonce(&self.iv, self.seq);
        let mut inner = self.aead.open(&nonce, header, ciphertext)?;
        self.seq += 1;

        // Strip trailing zero padding, then the inner content type
        while inner.last() == Some(&0) {
            inner.pop();
        }
        match inner.pop() {
            Some(content_type) => Ok((content_type, inner)),
            None => Err(Error::invalid_frame("Record without content type")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::key_schedule::traffic_keys;
    use crate::tls::{CONTENT_HANDSHAKE, TLS_AES_128_GCM_SHA256};

    fn suite() -> Suite {
        Suite::from_id(TLS_AES_128_GCM_SHA256).unwrap()
    }

    fn keys() -> TrafficKeys {
        traffic_keys(suite(), &[0x42u8; 32]).unwrap()
    }

    #[test]
    fn test_nonce_xor_extracts_seq() {
        let iv = [0xA5u8; 12];
        for seq in [0u64, 1, 255, 0x0123_4567_89AB_CDEF] {
            let nonce = build_nonce(&iv, seq);
            // XOR with the IV recovers the big-endian counter in the tail
            let mut tail = [0u8; 8];
            for i in 0..8 {
                tail[i] = nonce[4 + i] ^ iv[4 + i];
            }
            assert_eq!(u64::from_be_bytes(tail), seq);
            assert_eq!(&nonce[..4], &iv[..4]);
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut enc = RecordEncrypter::new(suite(), &keys()).unwrap();
        let mut dec = RecordDecrypter::new(suite(), &keys()).unwrap();

        for payload in [&b"first"[..], &b"second record"[..], &[]] {
            let record = enc.encrypt(payload, CONTENT_APPLICATION_DATA).unwrap();
            assert_eq!(record[0], CONTENT_APPLICATION_DATA);
            assert_eq!(&record[1..3], &[0x03, 0x03]);
            let (inner_type, opened) = dec.open(&record).unwrap();
            assert_eq!(inner_type, CONTENT_APPLICATION_DATA);
            assert_eq!(opened, payload);
        }
    }

    #[test]
    fn test_inner_content_type_survives() {
        let mut enc = RecordEncrypter::new(suite(), &keys()).unwrap();
        let mut dec = RecordDecrypter::new(suite(), &keys()).unwrap();

        let ticket = enc.encrypt(b"ticket", CONTENT_HANDSHAKE).unwrap();
        let (inner_type, data) = dec.open(&ticket).unwrap();
        assert_eq!(inner_type, CONTENT_HANDSHAKE);
        assert_eq!(data, b"ticket");

        // The counter advanced, so the next record still opens
        let record = enc.encrypt(b"data", CONTENT_APPLICATION_DATA).unwrap();
        assert_eq!(dec.open(&record).unwrap().1, b"data");
    }

    #[test]
    fn test_out_of_sequence_fails() {
        let mut enc = RecordEncrypter::new(suite(), &keys()).unwrap();
        let mut dec = RecordDecrypter::new(suite(), &keys()).unwrap();

        let first = enc.encrypt(b"a", CONTENT_APPLICATION_DATA).unwrap();
        let second = enc.encrypt(b"b", CONTENT_APPLICATION_DATA).unwrap();
        // Skipping the first record desynchronizes the nonce
        assert!(dec.open(&second).is_err());
        let _ = first;
    }

    #[test]
    fn test_tampered_record_fails() {
        let mut enc = RecordEncrypter::new(suite(), &keys()).unwrap();
        let mut dec = RecordDecrypter::new(suite(), &keys()).unwrap();

        let mut record = enc.encrypt(b"payload", CONTENT_APPLICATION_DATA).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;
        assert!(dec.open(&record).is_err());
    }
}
