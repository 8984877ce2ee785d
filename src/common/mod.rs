//! Shared primitives used across the data plane

pub mod error;

pub use error::{Error, Result};

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Address types shared by the VLESS request header and mux metadata
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x02;
pub const ATYP_IPV6: u8 = 0x03;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// A flow destination: literal IP or domain name, plus port.
///
/// Wire encoding (port-first, shared by VLESS and mux): `u16-be port`,
/// `u8 addr_type`, then 4 raw bytes (v4), `u8 len` + bytes (domain) or
/// 16 raw bytes (v6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Build from a host string (IP literal or domain) and port.
    /// Bracketed IPv6 literals are accepted.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Address::Ip(SocketAddr::new(ip, port)));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(Error::config(format!("Invalid address host: {:?}", host)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }

    /// Encode as `port, addr_type, addr`
    pub fn encode_port_first(&self, buf: &mut BytesMut) {
        buf.put_u16(self.port());
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(host, _) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host.as_bytes());
            }
        }
    }

    /// Decode from `port, addr_type, addr`. Returns the address and the
    /// number of bytes consumed, or None when more bytes are needed.
    pub fn decode_port_first(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        let port = u16::from_be_bytes([buf[0], buf[1]]);
        match buf[2] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[3..7]);
                Ok(Some((
                    Address::Ip(SocketAddr::new(IpAddr::from(octets), port)),
                    7,
                )))
            }
            ATYP_DOMAIN => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = buf[3] as usize;
                if buf.len() < 4 + len {
                    return Ok(None);
                }
                let host = std::str::from_utf8(&buf[4..4 + len])
                    .map_err(|_| Error::invalid_frame("Non-UTF8 domain in address"))?;
                Ok(Some((Address::Domain(host.to_string(), port), 4 + len)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[3..19]);
                Ok(Some((
                    Address::Ip(SocketAddr::new(IpAddr::from(octets), port)),
                    19,
                )))
            }
            other => Err(Error::invalid_frame(format!(
                "Unknown address type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_roundtrip() {
        let addr = Address::new("192.0.2.1", 80).unwrap();
        let mut buf = BytesMut::new();
        addr.encode_port_first(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x50, 0x01, 0xC0, 0x00, 0x02, 0x01]);

        let (decoded, used) = Address::decode_port_first(&buf).unwrap().unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, 7);
    }

    #[test]
    fn test_ipv6_bracketed() {
        let addr = Address::new("[2001:db8::1]", 443).unwrap();
        let mut buf = BytesMut::new();
        addr.encode_port_first(&mut buf);
        assert_eq!(buf[2], ATYP_IPV6);
        assert_eq!(buf.len(), 2 + 1 + 16);

        let (decoded, _) = Address::decode_port_first(&buf).unwrap().unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_domain_roundtrip() {
        let addr = Address::new("example.com", 8443).unwrap();
        let mut buf = BytesMut::new();
        addr.encode_port_first(&mut buf);
        assert_eq!(buf[2], ATYP_DOMAIN);
        assert_eq!(buf[3] as usize, "example.com".len());

        let (decoded, used) = Address::decode_port_first(&buf).unwrap().unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_partial_decode() {
        let addr = Address::new("example.com", 8443).unwrap();
        let mut buf = BytesMut::new();
        addr.encode_port_first(&mut buf);
        assert!(Address::decode_port_first(&buf[..5]).unwrap().is_none());
    }
}
