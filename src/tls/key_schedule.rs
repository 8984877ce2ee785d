//! TLS 1.3 key schedule (RFC 8446 §7.1)

use super::{Suite, SuiteHash};
use crate::{Error, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

impl SuiteHash {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            SuiteHash::Sha256 => Sha256::digest(data).to_vec(),
            SuiteHash::Sha384 => Sha384::digest(data).to_vec(),
        }
    }

    pub fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            SuiteHash::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            SuiteHash::Sha384 => {
                let mut mac =
                    Hmac::<Sha384>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// Running handshake transcript; hashed on demand at checkpoints.
pub struct Transcript {
    hash: SuiteHash,
    messages: Vec<u8>,
}

impl Transcript {
    pub fn new(hash: SuiteHash) -> Self {
        Transcript {
            hash,
            messages: Vec::with_capacity(4096),
        }
    }

    /// Append one whole handshake message (header included)
    pub fn update(&mut self, message: &[u8]) {
        self.messages.extend_from_slice(message);
    }

    pub fn digest(&self) -> Vec<u8> {
        self.hash.digest(&self.messages)
    }
}

/// `HKDF-Extract(salt, ikm)`; an empty salt means a zero-filled hash-length salt.
pub fn hkdf_extract(hash: SuiteHash, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    match hash {
        SuiteHash::Sha256 => Hkdf::<Sha256>::extract(salt, ikm).0.to_vec(),
        SuiteHash::Sha384 => Hkdf::<Sha384>::extract(salt, ikm).0.to_vec(),
    }
}

/// Standard `HKDF-Expand`
pub fn hkdf_expand(hash: SuiteHash, prk: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut okm = vec![0u8; len];
    let expand = |r: std::result::Result<(), hkdf::InvalidLength>| {
        r.map_err(|_| Error::handshake("HKDF expand length invalid"))
    };
    match hash {
        SuiteHash::Sha256 => {
            let hk = Hkdf::<Sha256>::from_prk(prk)
                .map_err(|_| Error::handshake("HKDF PRK too short"))?;
            expand(hk.expand(info, &mut okm))?;
        }
        SuiteHash::Sha384 => {
            let hk = Hkdf::<Sha384>::from_prk(prk)
                .map_err(|_| Error::handshake("HKDF PRK too short"))?;
            expand(hk.expand(info, &mut okm))?;
        }
    }
    Ok(okm)
}

/// `HKDF-Expand-Label(secret, label, context, L)` with the `tls13 ` prefix
pub fn hkdf_expand_label(
    hash: SuiteHash,
    secret: &[u8],
    label: &str,
    context: &[u8],
    len: usize,
) -> Result<Vec<u8>> {
    let info = expand_label_info(label, context, len);
    hkdf_expand(hash, secret, &info, len)
}

/// `info = u16(L) || u8(len("tls13 "+label)) || "tls13 "+label || u8(len(ctx)) || ctx`
pub(crate) fn expand_label_info(label: &str, context: &[u8], len: usize) -> Vec<u8> {
    let full_label = format!("tls13 {}", label);
    let mut info = Vec::with_capacity(4 + full_label.len() + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(full_label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    info
}

/// `Derive-Secret(secret, label, messages)` given `H(messages)`
pub fn derive_secret(
    hash: SuiteHash,
    secret: &[u8],
    label: &str,
    transcript_hash: &[u8],
) -> Result<Vec<u8>> {
    hkdf_expand_label(hash, secret, label, transcript_hash, hash.len())
}

/// Per-direction traffic key material
pub struct TrafficKeys {
    pub key: Vec<u8>,
    pub iv: [u8; Suite::IV_LEN],
}

/// Expand a traffic secret into key + IV
pub fn traffic_keys(suite: Suite, secret: &[u8]) -> Result<TrafficKeys> {
    let key = hkdf_expand_label(suite.hash, secret, "key", &[], suite.key_len)?;
    let iv_vec = hkdf_expand_label(suite.hash, secret, "iv", &[], Suite::IV_LEN)?;
    let mut iv = [0u8; Suite::IV_LEN];
    iv.copy_from_slice(&iv_vec);
    Ok(TrafficKeys { key, iv })
}

/// Secrets derived from the ECDHE shared secret at the ServerHello boundary
pub struct HandshakeSecrets {
    pub handshake_secret: Vec<u8>,
    pub client_traffic: Vec<u8>,
    pub server_traffic: Vec<u8>,
}

/// Derive handshake traffic secrets from the shared secret and
/// `H(ClientHello || ServerHello)`.
pub fn handshake_secrets(
    suite: Suite,
    shared: &[u8],
    transcript_hash: &[u8],
) -> Result<HandshakeSecrets> {
    let hash = suite.hash;
    let early_secret = hkdf_extract(hash, &[], &vec![0u8; hash.len()]);
    let empty_hash = hash.digest(&[]);
    let derived = derive_secret(hash, &early_secret, "derived", &empty_hash)?;
    let handshake_secret = hkdf_extract(hash, &derived, shared);
    let client_traffic = derive_secret(hash, &handshake_secret, "c hs traffic", transcript_hash)?;
    let server_traffic = derive_secret(hash, &handshake_secret, "s hs traffic", transcript_hash)?;
    Ok(HandshakeSecrets {
        handshake_secret,
        client_traffic,
        server_traffic,
    })
}

/// Application traffic secrets derived after Server Finished
pub struct ApplicationSecrets {
    pub client_traffic: Vec<u8>,
    pub server_traffic: Vec<u8>,
}

pub fn application_secrets(
    suite: Suite,
    handshake_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<ApplicationSecrets> {
    let hash = suite.hash;
    let empty_hash = hash.digest(&[]);
    let derived = derive_secret(hash, handshake_secret, "derived", &empty_hash)?;
    let master_secret = hkdf_extract(hash, &derived, &vec![0u8; hash.len()]);
    let client_traffic = derive_secret(hash, &master_secret, "c ap traffic", transcript_hash)?;
    let server_traffic = derive_secret(hash, &master_secret, "s ap traffic", transcript_hash)?;
    Ok(ApplicationSecrets {
        client_traffic,
        server_traffic,
    })
}

/// `Finished` verify data for the direction owning `traffic_secret`
pub fn finished_verify(
    hash: SuiteHash,
    traffic_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>> {
    let finished_key = hkdf_expand_label(hash, traffic_secret, "finished", &[], hash.len())?;
    Ok(hash.hmac(&finished_key, transcript_hash))
}
