//! Minimal X.509 DER walking
//!
//! Only what CertificateVerify validation needs: pulling the
//! subjectPublicKeyInfo's key bits out of a certificate. Chain evaluation
//! itself goes through webpki.

use crate::{Error, Result};

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_VERSION_CONTEXT: u8 = 0xA0;

struct Der<'a> {
    data: &'a [u8],
}

impl<'a> Der<'a> {
    fn new(data: &'a [u8]) -> Self {
        Der { data }
    }

    /// Read one TLV; returns (tag, value) and advances past it
    fn read(&mut self) -> Result<(u8, &'a [u8])> {
        if self.data.len() < 2 {
            return Err(Error::certificate("Truncated DER element"));
        }
        let tag = self.data[0];
        let (len, header) = match self.data[1] {
            n if n < 0x80 => (n as usize, 2),
            0x81 => {
                if self.data.len() < 3 {
                    return Err(Error::certificate("Truncated DER length"));
                }
                (self.data[2] as usize, 3)
            }
            0x82 => {
                if self.data.len() < 4 {
                    return Err(Error::certificate("Truncated DER length"));
                }
                (
                    u16::from_be_bytes([self.data[2], self.data[3]]) as usize,
                    4,
                )
            }
            0x83 => {
                if self.data.len() < 5 {
                    return Err(Error::certificate("Truncated DER length"));
                }
                (
                    u32::from_be_bytes([0, self.data[2], self.data[3], self.data[4]]) as usize,
                    5,
                )
            }
            _ => return Err(Error::certificate("Unsupported DER length form")),
        };
        if self.data.len() < header + len {
            return Err(Error::certificate("DER element overruns buffer"));
        }
        let value = &self.data[header..header + len];
        self.data = &self.data[header + len..];
        Ok((tag, value))
    }

    fn expect(&mut self, expected: u8) -> Result<&'a [u8]> {
        let (tag, value) = self.read()?;
        if tag != expected {
            return Err(Error::certificate(format!(
                "Unexpected DER tag 0x{:02x}, wanted 0x{:02x}",
                tag, expected
            )));
        }
        Ok(value)
    }
}

/// Extract the subjectPublicKey bits from a DER certificate. For EC keys
/// this is the uncompressed point; for RSA the RSAPublicKey structure.
pub fn subject_public_key(cert_der: &[u8]) -> Result<Vec<u8>> {
    let mut outer = Der::new(cert_der);
    let certificate = outer.expect(TAG_SEQUENCE)?;

    let mut cert = Der::new(certificate);
    let tbs = cert.expect(TAG_SEQUENCE)?;

    let mut tbs = Der::new(tbs);
    // [0] EXPLICIT version is optional
    let (tag, _) = tbs.read()?;
    if tag == TAG_VERSION_CONTEXT {
        tbs.expect(TAG_INTEGER)?; // serialNumber
    } else if tag != TAG_INTEGER {
        return Err(Error::certificate("Malformed TBSCertificate"));
    }
    tbs.expect(TAG_SEQUENCE)?; // signature algorithm
    tbs.expect(TAG_SEQUENCE)?; // issuer
    tbs.expect(TAG_SEQUENCE)?; // validity
    tbs.expect(TAG_SEQUENCE)?; // subject

    let spki = tbs.expect(TAG_SEQUENCE)?;
    let mut spki = Der::new(spki);
    spki.expect(TAG_SEQUENCE)?; // algorithm identifier
    let bits = spki.expect(TAG_BIT_STRING)?;
    if bits.is_empty() || bits[0] != 0 {
        return Err(Error::certificate("Unsupported public key bit padding"));
    }
    Ok(bits[1..].to_vec())
}
