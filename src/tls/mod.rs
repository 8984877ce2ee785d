//! Hand-written TLS 1.3 client core
//!
//! rustls cannot emit byte-exact browser ClientHellos or the Reality
//! handshake, so the record layer, key schedule and handshake driver live
//! here; certificate chains are still evaluated through rustls/webpki
//! (`client::verifier`). Only TLS 1.3 is spoken.

pub mod client;
pub mod fingerprint;
pub mod key_schedule;
pub mod reality;
pub mod record;
pub mod x509;

use crate::{Error, Result};

/// TLS record content types
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;

/// Handshake message types
pub const HS_CLIENT_HELLO: u8 = 0x01;
pub const HS_SERVER_HELLO: u8 = 0x02;
pub const HS_NEW_SESSION_TICKET: u8 = 0x04;
pub const HS_ENCRYPTED_EXTENSIONS: u8 = 0x08;
pub const HS_CERTIFICATE: u8 = 0x0B;
pub const HS_CERTIFICATE_VERIFY: u8 = 0x0F;
pub const HS_FINISHED: u8 = 0x14;

/// TLS 1.3 cipher suites
pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;
pub const TLS_CHACHA20_POLY1305_SHA256: u16 = 0x1303;
pub const TLS_AES_128_CCM_SHA256: u16 = 0x1304;

/// Transcript hash selector per suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteHash {
    Sha256,
    Sha384,
}

impl SuiteHash {
    pub fn len(self) -> usize {
        match self {
            SuiteHash::Sha256 => 32,
            SuiteHash::Sha384 => 48,
        }
    }
}

/// Negotiated cipher suite parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suite {
    pub id: u16,
    pub hash: SuiteHash,
    pub key_len: usize,
}

impl Suite {
    pub const IV_LEN: usize = 12;

    pub fn from_id(id: u16) -> Result<Suite> {
        match id {
            TLS_AES_128_GCM_SHA256 | TLS_CHACHA20_POLY1305_SHA256 => Ok(Suite {
                id,
                hash: SuiteHash::Sha256,
                key_len: 16,
            }),
            TLS_AES_256_GCM_SHA384 => Ok(Suite {
                id,
                hash: SuiteHash::Sha384,
                key_len: 32,
            }),
            other => Err(Error::handshake(format!(
                "Unsupported cipher suite: 0x{:04x}",
                other
            ))),
        }
    }
}

/// Format a fatal alert payload into the surfaced error
pub(crate) fn alert_error(payload: &[u8]) -> Error {
    if payload.len() >= 2 {
        Error::handshake(format!(
            "TLS Alert: level={}, desc={}",
            payload[0], payload[1]
        ))
    } else {
        Error::handshake("TLS Alert: truncated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_parameters() {
        let s = Suite::from_id(TLS_AES_128_GCM_SHA256).unwrap();
        assert_eq!(s.hash, SuiteHash::Sha256);
        assert_eq!(s.key_len, 16);

        let s = Suite::from_id(TLS_AES_256_GCM_SHA384).unwrap();
        assert_eq!(s.hash, SuiteHash::Sha384);
        assert_eq!(s.key_len, 32);

        let s = Suite::from_id(TLS_CHACHA20_POLY1305_SHA256).unwrap();
        assert_eq!(s.key_len, 16);

        assert!(Suite::from_id(TLS_AES_128_CCM_SHA256).is_err());
        assert!(Suite::from_id(0x002F).is_err());
    }

    #[test]
    fn test_alert_error_format() {
        let e = alert_error(&[2, 40]);
        assert_eq!(
            e.to_string(),
            "Handshake failed: TLS Alert: level=2, desc=40"
        );
    }
}
