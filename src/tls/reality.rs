//! Reality client handshake
//!
//! A TLS-1.3-lookalike where the authentication material is sealed into the
//! ClientHello session id with AES-GCM under a key agreed against the
//! server's long-term X25519 key. The handshake itself is the standard
//! driver with certificate validation off; authenticity derives from the
//! server having been able to open the session-id tag.

use super::client::{handshake, HandshakeParams};
use super::fingerprint::{build_client_hello, ClientHelloParams};
use crate::config::Fingerprint;
use crate::transport::Stream;
use crate::{Error, Result};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey, StaticSecret};

/// Session-id seal: AES-256-GCM with the tag truncated to 12 bytes, so the
/// 16-byte plaintext yields exactly 28 bytes of output.
type SessionAead = AesGcm<Aes256, U12, U12>;

/// Client version bytes advertised in the clear part of the session id
const VERSION: [u8; 3] = [0, 4, 0];

pub struct RealityOptions {
    pub server_name: String,
    /// Server long-term X25519 public key
    pub public_key: [u8; 32],
    /// 0 to 8 bytes
    pub short_id: Vec<u8>,
    pub fingerprint: Fingerprint,
    pub alpn: Option<Vec<String>>,
}

/// Reality handshake over `inner`
pub async fn connect(inner: Stream, opts: &RealityOptions) -> Result<Stream> {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let random: [u8; 32] = rand::random();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::setup("System clock before epoch"))?
        .as_secs() as u32;

    let session_id = build_session_id(opts, &secret, &random, now)?;

    let params = HandshakeParams {
        server_name: opts.server_name.clone(),
        alpn: opts.alpn.clone(),
        fingerprint: opts.fingerprint,
        random,
        session_id,
        secret,
        validate_certs: false,
        reality_signal: true,
    };
    handshake(inner, params).await
}

/// Build the authenticated 32-byte session id.
///
/// The first 16 bytes carry `major, minor, patch, 0, u32-be unix seconds,
/// short-id zero-padded to 8`; they are sealed in place with AES-GCM. The
/// AAD is the raw ClientHello built with an all-zero session id, which the
/// server can reconstruct.
fn build_session_id(
    opts: &RealityOptions,
    secret: &StaticSecret,
    random: &[u8; 32],
    unix_seconds: u32,
) -> Result<[u8; 32]> {
    if opts.short_id.len() > 8 {
        return Err(Error::setup("Reality short id longer than 8 bytes"));
    }

    let mut session_id = [0u8; 32];
    session_id[0..3].copy_from_slice(&VERSION);
    session_id[3] = 0;
    session_id[4..8].copy_from_slice(&unix_seconds.to_be_bytes());
    session_id[8..8 + opts.short_id.len()].copy_from_slice(&opts.short_id);

    let aad = build_client_hello(&ClientHelloParams {
        fingerprint: opts.fingerprint,
        random: *random,
        session_id: [0u8; 32],
        server_name: &opts.server_name,
        key_share: PublicKey::from(secret).to_bytes(),
        alpn: opts.alpn.as_deref(),
    })?;

    let shared = secret.diffie_hellman(&PublicKey::from(opts.public_key));
    let key = derive_auth_key(shared.as_bytes(), &random[0..20])?;

    let cipher = SessionAead::new_from_slice(&key)
        .map_err(|_| Error::setup("Reality auth key length"))?;
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&random[20..32]),
            Payload {
                msg: &session_id[..16],
                aad: &aad,
            },
        )
        .map_err(|_| Error::setup("Reality session id seal failed"))?;

    debug_assert_eq!(sealed.len(), 28);
    session_id[..28].copy_from_slice(&sealed);
    // Bytes 28..32 keep their built (zero) values
    for byte in session_id[28..].iter_mut() {
        *byte = 0;
    }
    Ok(session_id)
}

/// `HKDF-SHA256(ikm = ECDH shared, salt = random[0..20], info = "REALITY")`
fn derive_auth_key(shared: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; 32];
    hk.expand(b"REALITY", &mut key)
        .map_err(|_| Error::setup("Reality key derivation"))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RealityOptions {
        RealityOptions {
            server_name: "www.example.com".to_string(),
            public_key: [0u8; 32],
            short_id: vec![0xAB, 0xCD],
            fingerprint: Fingerprint::Chrome,
            alpn: None,
        }
    }

    #[test]
    fn test_session_id_is_deterministic() {
        let secret = StaticSecret::from([1u8; 32]);
        let random = [0u8; 32];
        let a = build_session_id(&opts(), &secret, &random, 1_700_000_000).unwrap();
        let b = build_session_id(&opts(), &secret, &random, 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[28..], &[0u8; 4]);
    }

    #[test]
    fn test_session_id_opens_with_derived_key_and_zero_sid_aad() {
        let secret = StaticSecret::from([1u8; 32]);
        let random = [0u8; 32];
        let now = 1_700_000_000u32;
        let opts = opts();
        let session_id = build_session_id(&opts, &secret, &random, now).unwrap();

        // Reconstruct what the server does: same ECDH, same HKDF, and the
        // ClientHello with a zero session id as AAD.
        let shared = secret.diffie_hellman(&PublicKey::from(opts.public_key));
        let key = derive_auth_key(shared.as_bytes(), &random[0..20]).unwrap();
        let aad = build_client_hello(&ClientHelloParams {
            fingerprint: opts.fingerprint,
            random,
            session_id: [0u8; 32],
            server_name: &opts.server_name,
            key_share: PublicKey::from(&secret).to_bytes(),
            alpn: None,
        })
        .unwrap();

        let cipher = SessionAead::new_from_slice(&key).unwrap();
        let opened = cipher
            .decrypt(
                Nonce::from_slice(&random[20..32]),
                Payload {
                    msg: &session_id[..28],
                    aad: &aad,
                },
            )
            .unwrap();

        assert_eq!(opened.len(), 16);
        assert_eq!(&opened[0..3], &VERSION);
        assert_eq!(opened[3], 0);
        assert_eq!(&opened[4..8], &now.to_be_bytes());
        assert_eq!(&opened[8..10], &[0xAB, 0xCD]);
        assert_eq!(&opened[10..16], &[0u8; 6]);
    }

    #[test]
    fn test_wrong_aad_fails_to_open() {
        let secret = StaticSecret::from([1u8; 32]);
        let random = [0u8; 32];
        let opts = opts();
        let session_id = build_session_id(&opts, &secret, &random, 1).unwrap();

        let shared = secret.diffie_hellman(&PublicKey::from(opts.public_key));
        let key = derive_auth_key(shared.as_bytes(), &random[0..20]).unwrap();
        let cipher = SessionAead::new_from_slice(&key).unwrap();
        let result = cipher.decrypt(
            Nonce::from_slice(&random[20..32]),
            Payload {
                msg: &session_id[..28],
                aad: b"not the client hello",
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_long_short_id() {
        let secret = StaticSecret::from([1u8; 32]);
        let mut bad = opts();
        bad.short_id = vec![0u8; 9];
        assert!(build_session_id(&bad, &secret, &[0u8; 32], 1).is_err());
    }
}
