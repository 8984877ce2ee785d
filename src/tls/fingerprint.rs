//! ClientHello builder with browser fingerprint emulation
//!
//! Emits wire-exact ClientHellos for five browser profiles plus a `random`
//! selector. The builder is deterministic in its inputs: GREASE values come
//! from bytes 24..30 of the client random, the Chrome extension shuffle is
//! seeded from bytes 24..32, and the GREASE-ECH fields are SHA-256 chains
//! over the random. Reality reuses the builder with a caller-controlled
//! session id, so determinism here is load-bearing.

use crate::config::Fingerprint;
use crate::{Error, Result};
use sha2::{Digest, Sha256};

pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_STATUS_REQUEST: u16 = 0x0005;
pub const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
pub const EXT_EC_POINT_FORMATS: u16 = 0x000B;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000D;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_SCT: u16 = 0x0012;
pub const EXT_PADDING: u16 = 0x0015;
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 0x0017;
pub const EXT_COMPRESS_CERTIFICATE: u16 = 0x001B;
pub const EXT_RECORD_SIZE_LIMIT: u16 = 0x001C;
pub const EXT_DELEGATED_CREDENTIALS: u16 = 0x0022;
pub const EXT_SESSION_TICKET: u16 = 0x0023;
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002B;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 0x002D;
pub const EXT_KEY_SHARE: u16 = 0x0033;
pub const EXT_APPLICATION_SETTINGS: u16 = 0x4469;
pub const EXT_ECH: u16 = 0xFE0D;
pub const EXT_RENEGOTIATION_INFO: u16 = 0xFF01;

pub const GROUP_X25519: u16 = 0x001D;
pub const GROUP_SECP256R1: u16 = 0x0017;
pub const GROUP_SECP384R1: u16 = 0x0018;
pub const GROUP_SECP521R1: u16 = 0x0019;

/// BoringSSL-style GREASE table; every entry satisfies
/// `(v & 0x0F0F) == 0x0A0A`.
const GREASE_TABLE: [u16; 16] = [
    0x0A0A, 0x1A1A, 0x2A2A, 0x3A3A, 0x4A4A, 0x5A5A, 0x6A6A, 0x7A7A, 0x8A8A, 0x9A9A, 0xAAAA,
    0xBABA, 0xCACA, 0xDADA, 0xEAEA, 0xFAFA,
];

/// A value is GREASE iff both byte halves end in the 0x0A nibble.
pub fn is_grease(value: u16) -> bool {
    value & 0x0F0F == 0x0A0A
}

/// GREASE slots, one per reserved position, derived from random bytes 24..30
struct GreaseSeed {
    cipher: u16,
    group: u16,
    extension1: u16,
    extension2: u16,
    version: u16,
}

impl GreaseSeed {
    fn from_random(random: &[u8; 32]) -> Self {
        let pick = |i: usize| GREASE_TABLE[random[24 + i] as usize % 16];
        GreaseSeed {
            cipher: pick(0),
            group: pick(1),
            extension1: pick(2),
            extension2: pick(3),
            version: pick(4),
        }
    }
}

/// Builder inputs; the random must be exactly 32 bytes because the GREASE
/// derivation and shuffle seed read its tail.
pub struct ClientHelloParams<'a> {
    pub fingerprint: Fingerprint,
    pub random: [u8; 32],
    pub session_id: [u8; 32],
    pub server_name: &'a str,
    /// X25519 public key offered in the key share
    pub key_share: [u8; 32],
    /// Overrides the profile's ALPN list when present
    pub alpn: Option<&'a [String]>,
}

#[derive(Clone)]
struct Ext {
    typ: u16,
    payload: Vec<u8>,
}

/// Resolve the `random` selector to one concrete profile
pub fn resolve_fingerprint(fingerprint: Fingerprint, random: &[u8; 32]) -> Fingerprint {
    match fingerprint {
        Fingerprint::Random => [
            Fingerprint::Chrome,
            Fingerprint::Firefox,
            Fingerprint::Safari,
            Fingerprint::Ios,
            Fingerprint::Edge,
        ][random[0] as usize % 5],
        concrete => concrete,
    }
}

/// Build the full ClientHello handshake message (header included, no record
/// wrapping).
pub fn build_client_hello(params: &ClientHelloParams) -> Result<Vec<u8>> {
    if params.server_name.is_empty() {
        return Err(Error::setup("ClientHello requires a server name"));
    }
    let fingerprint = resolve_fingerprint(params.fingerprint, &params.random);
    let grease = GreaseSeed::from_random(&params.random);

    let (ciphers, mut extensions, shuffle, pad) = match fingerprint {
        Fingerprint::Chrome | Fingerprint::Edge => chromium_profile(params, &grease),
        Fingerprint::Safari | Fingerprint::Ios => safari_profile(params, &grease),
        Fingerprint::Firefox => firefox_profile(params),
        Fingerprint::Random => unreachable!("resolved above"),
    };

    if shuffle {
        shuffle_extensions(&mut extensions, &params.random);
    }

    let mut message = assemble(params, &ciphers, &extensions);
    if pad && (256..=511).contains(&message.len()) {
        let needed = 512 - message.len();
        let payload_len = if needed >= 4 { needed - 4 } else { needed + 512 - 4 };
        extensions.push(Ext {
            typ: EXT_PADDING,
            payload: vec![0u8; payload_len],
        });
        message = assemble(params, &ciphers, &extensions);
    }
    Ok(message)
}

fn chromium_profile(
    params: &ClientHelloParams,
    grease: &GreaseSeed,
) -> (Vec<u16>, Vec<Ext>, bool, bool) {
    let ciphers = vec![
        grease.cipher,
        0x1301, 0x1302, 0x1303, 0xC02B, 0xC02F, 0xC02C, 0xC030, 0xCCA9, 0xCCA8, 0xC013, 0xC014,
        0x009C, 0x009D, 0x002F, 0x0035,
    ];
    let alpn = params
        .alpn
        .map(to_alpn_list)
        .unwrap_or_else(|| vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

    let extensions = vec![
        Ext { typ: grease.extension1, payload: Vec::new() },
        ext_server_name(params.server_name),
        Ext { typ: EXT_EXTENDED_MASTER_SECRET, payload: Vec::new() },
        Ext { typ: EXT_RENEGOTIATION_INFO, payload: vec![0] },
        ext_supported_groups(&[grease.group, GROUP_X25519, GROUP_SECP256R1, GROUP_SECP384R1]),
        Ext { typ: EXT_EC_POINT_FORMATS, payload: vec![1, 0] },
        Ext { typ: EXT_SESSION_TICKET, payload: Vec::new() },
        ext_alpn(&alpn),
        ext_status_request(),
        ext_signature_algorithms(&[
            0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
        ]),
        Ext { typ: EXT_SCT, payload: Vec::new() },
        ext_key_share(&[(grease.group, &[0]), (GROUP_X25519, &params.key_share)]),
        Ext { typ: EXT_PSK_KEY_EXCHANGE_MODES, payload: vec![1, 1] },
        ext_supported_versions(&[grease.version, 0x0304, 0x0303]),
        ext_compress_certificate(&[0x0002]), // brotli
        ext_application_settings(),
        ext_ech_grease(&params.random, chrome_ech_payload_len(&params.random)),
        Ext { typ: grease.extension2, payload: vec![0] },
    ];
    (ciphers, extensions, true, true)
}

fn safari_profile(
    params: &ClientHelloParams,
    grease: &GreaseSeed,
) -> (Vec<u16>, Vec<Ext>, bool, bool) {
    let ciphers = vec![
        grease.cipher,
        0x1301, 0x1302, 0x1303, 0xC02C, 0xC02B, 0xCCA9, 0xC030, 0xC02F, 0xCCA8, 0xC00A, 0xC009,
        0xC014, 0xC013, 0x009D, 0x009C, 0x0035, 0x002F, 0xC008, 0xC012, 0x000A,
    ];
    let alpn = params
        .alpn
        .map(to_alpn_list)
        .unwrap_or_else(|| vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

    let extensions = vec![
        Ext { typ: grease.extension1, payload: Vec::new() },
        ext_server_name(params.server_name),
        Ext { typ: EXT_EXTENDED_MASTER_SECRET, payload: Vec::new() },
        Ext { typ: EXT_RENEGOTIATION_INFO, payload: vec![0] },
        ext_supported_groups(&[
            grease.group,
            GROUP_X25519,
            GROUP_SECP256R1,
            GROUP_SECP384R1,
            GROUP_SECP521R1,
        ]),
        Ext { typ: EXT_EC_POINT_FORMATS, payload: vec![1, 0] },
        ext_alpn(&alpn),
        ext_status_request(),
        ext_signature_algorithms(&[
            0x0403, 0x0804, 0x0401, 0x0503, 0x0203, 0x0805, 0x0501, 0x0806, 0x0601, 0x0201,
        ]),
        Ext { typ: EXT_SCT, payload: Vec::new() },
        ext_key_share(&[(grease.group, &[0]), (GROUP_X25519, &params.key_share)]),
        Ext { typ: EXT_PSK_KEY_EXCHANGE_MODES, payload: vec![1, 1] },
        ext_supported_versions(&[grease.version, 0x0304, 0x0303, 0x0302, 0x0301]),
        ext_compress_certificate(&[0x0001]), // zlib
        Ext { typ: grease.extension2, payload: vec![0] },
    ];
    (ciphers, extensions, false, true)
}

fn firefox_profile(params: &ClientHelloParams) -> (Vec<u16>, Vec<Ext>, bool, bool) {
    let ciphers = vec![
        0x1301, 0x1303, 0x1302, 0xC02B, 0xC02F, 0xCCA9, 0xCCA8, 0xC02C, 0xC030, 0xC00A, 0xC009,
        0xC013, 0xC014, 0x009C, 0x009D, 0x002F, 0x0035,
    ];
    let alpn = params
        .alpn
        .map(to_alpn_list)
        .unwrap_or_else(|| vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    let p256_share = firefox_p256_share(&params.random);

    let extensions = vec![
        ext_server_name(params.server_name),
        Ext { typ: EXT_EXTENDED_MASTER_SECRET, payload: Vec::new() },
        Ext { typ: EXT_RENEGOTIATION_INFO, payload: vec![0] },
        ext_supported_groups(&[
            GROUP_X25519,
            GROUP_SECP256R1,
            GROUP_SECP384R1,
            GROUP_SECP521R1,
            0x0100, // ffdhe2048
            0x0101, // ffdhe3072
        ]),
        Ext { typ: EXT_EC_POINT_FORMATS, payload: vec![1, 0] },
        Ext { typ: EXT_SESSION_TICKET, payload: Vec::new() },
        ext_alpn(&alpn),
        ext_status_request(),
        ext_delegated_credentials(&[0x0403, 0x0503, 0x0603, 0x0203]),
        ext_key_share(&[
            (GROUP_X25519, &params.key_share),
            (GROUP_SECP256R1, &p256_share),
        ]),
        ext_supported_versions(&[0x0304, 0x0303]),
        ext_signature_algorithms(&[
            0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203,
            0x0201,
        ]),
        Ext { typ: EXT_PSK_KEY_EXCHANGE_MODES, payload: vec![1, 1] },
        ext_record_size_limit(0x4001),
        ext_ech_grease(&params.random, 223),
    ];
    (ciphers, extensions, false, false)
}

/// Firefox offers a second P-256 key share. Its scalar is derived
/// deterministically from the client random so the hello is reproducible.
fn firefox_p256_share(random: &[u8; 32]) -> Vec<u8> {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    let mut seed: Vec<u8> = Vec::with_capacity(48);
    seed.extend_from_slice(random);
    seed.extend_from_slice(b"p256-fingerprint");
    loop {
        let digest = Sha256::digest(&seed);
        if let Ok(secret) = p256::SecretKey::from_slice(&digest) {
            return secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        }
        seed = digest.to_vec();
    }
}

fn to_alpn_list(protos: &[String]) -> Vec<Vec<u8>> {
    protos.iter().map(|p| p.as_bytes().to_vec()).collect()
}

fn ext_server_name(name: &str) -> Ext {
    let mut payload = Vec::with_capacity(name.len() + 5);
    payload.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    payload.push(0); // host_name
    payload.extend_from_slice(&(name.len() as u16).to_be_bytes());
    payload.extend_from_slice(name.as_bytes());
    Ext {
        typ: EXT_SERVER_NAME,
        payload,
    }
}

fn ext_supported_groups(groups: &[u16]) -> Ext {
    let mut payload = Vec::with_capacity(groups.len() * 2 + 2);
    payload.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
    for group in groups {
        payload.extend_from_slice(&group.to_be_bytes());
    }
    Ext {
        typ: EXT_SUPPORTED_GROUPS,
        payload,
    }
}

fn ext_alpn(protos: &[Vec<u8>]) -> Ext {
    let total: usize = protos.iter().map(|p| p.len() + 1).sum();
    let mut payload = Vec::with_capacity(total + 2);
    payload.extend_from_slice(&(total as u16).to_be_bytes());
    for proto in protos {
        payload.push(proto.len() as u8);
        payload.extend_from_slice(proto);
    }
    Ext {
        typ: EXT_ALPN,
        payload,
    }
}

fn ext_status_request() -> Ext {
    Ext {
        typ: EXT_STATUS_REQUEST,
        payload: vec![0x01, 0, 0, 0, 0],
    }
}

fn ext_signature_algorithms(algs: &[u16]) -> Ext {
    let mut payload = Vec::with_capacity(algs.len() * 2 + 2);
    payload.extend_from_slice(&((algs.len() * 2) as u16).to_be_bytes());
    for alg in algs {
        payload.extend_from_slice(&alg.to_be_bytes());
    }
    Ext {
        typ: EXT_SIGNATURE_ALGORITHMS,
        payload,
    }
}

fn ext_delegated_credentials(algs: &[u16]) -> Ext {
    let mut ext = ext_signature_algorithms(algs);
    ext.typ = EXT_DELEGATED_CREDENTIALS;
    ext
}

fn ext_key_share(entries: &[(u16, &[u8])]) -> Ext {
    let total: usize = entries.iter().map(|(_, key)| key.len() + 4).sum();
    let mut payload = Vec::with_capacity(total + 2);
    payload.extend_from_slice(&(total as u16).to_be_bytes());
    for (group, key) in entries {
        payload.extend_from_slice(&group.to_be_bytes());
        payload.extend_from_slice(&(key.len() as u16).to_be_bytes());
        payload.extend_from_slice(key);
    }
    Ext {
        typ: EXT_KEY_SHARE,
        payload,
    }
}

fn ext_supported_versions(versions: &[u16]) -> Ext {
    let mut payload = Vec::with_capacity(versions.len() * 2 + 1);
    payload.push((versions.len() * 2) as u8);
    for version in versions {
        payload.extend_from_slice(&version.to_be_bytes());
    }
    Ext {
        typ: EXT_SUPPORTED_VERSIONS,
        payload,
    }
}

fn ext_compress_certificate(algs: &[u16]) -> Ext {
    let mut payload = Vec::with_capacity(algs.len() * 2 + 1);
    payload.push((algs.len() * 2) as u8);
    for alg in algs {
        payload.extend_from_slice(&alg.to_be_bytes());
    }
    Ext {
        typ: EXT_COMPRESS_CERTIFICATE,
        payload,
    }
}

fn ext_application_settings() -> Ext {
    Ext {
        typ: EXT_APPLICATION_SETTINGS,
        payload: vec![0x00, 0x03, 0x02, b'h', b'2'],
    }
}

fn ext_record_size_limit(limit: u16) -> Ext {
    Ext {
        typ: EXT_RECORD_SIZE_LIMIT,
        payload: limit.to_be_bytes().to_vec(),
    }
}

/// Chrome draws the GREASE-ECH payload length from four buckets
fn chrome_ech_payload_len(random: &[u8; 32]) -> usize {
    [144, 176, 208, 240][random[30] as usize % 4]
}

/// SHA-256 chain keyed by the client random; extends to any length
fn derive_stream(random: &[u8; 32], label: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut current: Vec<u8> = Vec::with_capacity(32 + label.len());
    current.extend_from_slice(random);
    current.extend_from_slice(label.as_bytes());
    while out.len() < len {
        let digest = Sha256::digest(&current);
        out.extend_from_slice(&digest);
        current = digest.to_vec();
    }
    out.truncate(len);
    out
}

/// GREASE encrypted-client-hello:
/// `u8(0) || u16(kdf) || u16(aead) || u8(config_id) || u16(encLen) || enc ||
/// u16(payloadLen) || payload`
fn ext_ech_grease(random: &[u8; 32], payload_len: usize) -> Ext {
    let enc = derive_stream(random, "ech-enc", 32);
    let body = derive_stream(random, "ech-payload", payload_len);
    let config_id = derive_stream(random, "ech-config", 1)[0];

    let mut payload = Vec::with_capacity(40 + payload_len);
    payload.push(0x00); // outer client hello
    payload.extend_from_slice(&0x0001u16.to_be_bytes()); // HKDF-SHA256
    payload.extend_from_slice(&0x0001u16.to_be_bytes()); // AES-128-GCM
    payload.push(config_id);
    payload.extend_from_slice(&(enc.len() as u16).to_be_bytes());
    payload.extend_from_slice(&enc);
    payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
    payload.extend_from_slice(&body);
    Ext {
        typ: EXT_ECH,
        payload,
    }
}

/// Chrome 106+ deterministic extension shuffle: a Fisher-Yates pass over all
/// non-GREASE positions driven by an LCG seeded from random bytes 24..32.
fn shuffle_extensions(extensions: &mut [Ext], random: &[u8; 32]) {
    let mut seed = u64::from_be_bytes(random[24..32].try_into().expect("8 bytes"));
    let positions: Vec<usize> = extensions
        .iter()
        .enumerate()
        .filter(|(_, ext)| !is_grease(ext.typ) && ext.typ != EXT_PADDING)
        .map(|(i, _)| i)
        .collect();

    let mut order: Vec<usize> = positions.clone();
    for i in (1..order.len()).rev() {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = ((seed >> 33) % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }

    let originals: Vec<Ext> = positions.iter().map(|&i| extensions[i].clone()).collect();
    for (slot, src) in positions.iter().zip(order.iter()) {
        let src_pos = positions.iter().position(|p| p == src).expect("member");
        extensions[*slot] = originals[src_pos].clone();
    }
}

fn assemble(params: &ClientHelloParams, ciphers: &[u16], extensions: &[Ext]) -> Vec<u8> {
    let mut body = Vec::with_capacity(512);
    body.extend_from_slice(&0x0303u16.to_be_bytes()); // legacy_version
    body.extend_from_slice(&params.random);
    body.push(32);
    body.extend_from_slice(&params.session_id);
    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for cipher in ciphers {
        body.extend_from_slice(&cipher.to_be_bytes());
    }
    body.push(1);
    body.push(0); // null compression

    let ext_total: usize = extensions.iter().map(|e| e.payload.len() + 4).sum();
    body.extend_from_slice(&(ext_total as u16).to_be_bytes());
    for ext in extensions {
        body.extend_from_slice(&ext.typ.to_be_bytes());
        body.extend_from_slice(&(ext.payload.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext.payload);
    }

    let mut message = Vec::with_capacity(body.len() + 4);
    message.push(super::HS_CLIENT_HELLO);
    message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    message.extend_from_slice(&body);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(fp: Fingerprint, random: [u8; 32]) -> ClientHelloParams<'static> {
        ClientHelloParams {
            fingerprint: fp,
            random,
            session_id: [0u8; 32],
            server_name: "www.example.com",
            key_share: [9u8; 32],
            alpn: None,
        }
    }

    /// Walk the extension list of an assembled hello
    fn extension_types(message: &[u8]) -> Vec<u16> {
        // header(4) + version(2) + random(32) + sid_len(1) + sid(32)
        let mut offset = 4 + 2 + 32 + 1 + 32;
        let cipher_len =
            u16::from_be_bytes([message[offset], message[offset + 1]]) as usize;
        offset += 2 + cipher_len + 2; // ciphers + compression
        let ext_total = u16::from_be_bytes([message[offset], message[offset + 1]]) as usize;
        offset += 2;
        let end = offset + ext_total;
        let mut types = Vec::new();
        while offset < end {
            let typ = u16::from_be_bytes([message[offset], message[offset + 1]]);
            let len = u16::from_be_bytes([message[offset + 2], message[offset + 3]]) as usize;
            types.push(typ);
            offset += 4 + len;
        }
        assert_eq!(offset, end);
        types
    }

    #[test]
    fn test_grease_law() {
        for entry in GREASE_TABLE {
            assert!(is_grease(entry));
        }
        assert!(!is_grease(0x1301));
        assert!(!is_grease(EXT_ECH));

        // No non-GREASE extension in any profile matches the GREASE pattern
        for fp in [
            Fingerprint::Chrome,
            Fingerprint::Firefox,
            Fingerprint::Safari,
            Fingerprint::Ios,
            Fingerprint::Edge,
        ] {
            let message = build_client_hello(&params(fp, [7u8; 32])).unwrap();
            let types = extension_types(&message);
            let grease_count = types.iter().filter(|t| is_grease(**t)).count();
            match fp {
                Fingerprint::Firefox => assert_eq!(grease_count, 0),
                _ => assert_eq!(grease_count, 2),
            }
        }
    }

    #[test]
    fn test_deterministic_for_fixed_inputs() {
        let a = build_client_hello(&params(Fingerprint::Chrome, [3u8; 32])).unwrap();
        let b = build_client_hello(&params(Fingerprint::Chrome, [3u8; 32])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_shuffle_depends_on_seed_bytes() {
        let mut r1 = [0u8; 32];
        let mut r2 = [0u8; 32];
        r1[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        r2[24..32].copy_from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]);

        let t1 = extension_types(&build_client_hello(&params(Fingerprint::Chrome, r1)).unwrap());
        let t2 = extension_types(&build_client_hello(&params(Fingerprint::Chrome, r2)).unwrap());
        assert_ne!(t1, t2, "different seeds should shuffle differently");

        // Same multiset of extensions either way
        let mut s1 = t1.iter().filter(|t| !is_grease(**t)).collect::<Vec<_>>();
        let mut s2 = t2.iter().filter(|t| !is_grease(**t)).collect::<Vec<_>>();
        s1.sort_unstable();
        s2.sort_unstable();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_grease_positions_fixed_under_shuffle() {
        for seed in 0u8..8 {
            let mut random = [seed; 32];
            random[24..32].copy_from_slice(&[seed; 8]);
            let types =
                extension_types(&build_client_hello(&params(Fingerprint::Chrome, random)).unwrap());
            assert!(is_grease(types[0]), "first extension stays GREASE");
            let last_non_padding = types
                .iter()
                .rev()
                .find(|t| **t != EXT_PADDING)
                .copied()
                .unwrap();
            assert!(is_grease(last_non_padding), "last extension stays GREASE");
        }
    }

    #[test]
    fn test_padded_profiles_never_land_in_the_band() {
        for fp in [Fingerprint::Chrome, Fingerprint::Safari, Fingerprint::Edge] {
            for sni in ["a.io", "www.example.com", "very-long-host-name.example.org"] {
                let p = ClientHelloParams {
                    server_name: sni,
                    ..params(fp, [5u8; 32])
                };
                let message = build_client_hello(&p).unwrap();
                assert!(
                    message.len() < 256 || message.len() >= 512,
                    "{:?}/{} landed at {}",
                    fp,
                    sni,
                    message.len()
                );
            }
        }
    }

    #[test]
    fn test_firefox_has_two_key_shares() {
        let message = build_client_hello(&params(Fingerprint::Firefox, [7u8; 32])).unwrap();
        let needle = {
            let mut n = Vec::new();
            n.extend_from_slice(&GROUP_X25519.to_be_bytes());
            n.extend_from_slice(&32u16.to_be_bytes());
            n.extend_from_slice(&[9u8; 32]);
            n
        };
        assert!(message
            .windows(needle.len())
            .any(|w| w == needle.as_slice()));
        // P-256 share is a 65-byte uncompressed point
        let p256 = firefox_p256_share(&[7u8; 32]);
        assert_eq!(p256.len(), 65);
        assert_eq!(p256[0], 0x04);
        assert!(message.windows(p256.len()).any(|w| w == p256.as_slice()));
        // Deterministic
        assert_eq!(p256, firefox_p256_share(&[7u8; 32]));
    }

    #[test]
    fn test_chrome_ech_payload_buckets() {
        for (b, expect) in [(0u8, 144usize), (1, 176), (2, 208), (3, 240), (4, 144)] {
            let mut random = [0u8; 32];
            random[30] = b;
            assert_eq!(chrome_ech_payload_len(&random), expect);
        }
    }

    #[test]
    fn test_random_selector_resolves() {
        let mut random = [0u8; 32];
        random[0] = 2;
        assert_eq!(
            resolve_fingerprint(Fingerprint::Random, &random),
            Fingerprint::Safari
        );
        assert_eq!(
            resolve_fingerprint(Fingerprint::Firefox, &random),
            Fingerprint::Firefox
        );
    }

    #[test]
    fn test_session_id_embedded_verbatim() {
        let mut p = params(Fingerprint::Safari, [1u8; 32]);
        p.session_id = [0xCD; 32];
        let message = build_client_hello(&p).unwrap();
        // sid length byte then the session id at a fixed offset
        assert_eq!(message[4 + 2 + 32], 32);
        assert_eq!(&message[4 + 2 + 32 + 1..4 + 2 + 32 + 1 + 32], &[0xCD; 32]);
    }
}
