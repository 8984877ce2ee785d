//! Error types for the data plane

use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Data-plane error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("DNS resolution failed: {0}")]
    Resolution(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Certificate validation failed: {0}")]
    CertificateValidation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Record-layer AEAD open failed after the handshake. Carries the raw
    /// record bytes (header included) so the Vision reader can pass them
    /// through once the server has switched to direct copy.
    #[error("Decryption failed ({} raw bytes)", .0.len())]
    Decryption(Bytes),

    /// Silent drop; never surfaced to the user.
    #[error("Dropped")]
    Dropped,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Not connected")]
    NotConnected,
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn resolution<S: Into<String>>(msg: S) -> Self {
        Error::Resolution(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Error::Handshake(msg.into())
    }

    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        Error::CertificateValidation(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Authentication(msg.into())
    }

    pub fn upgrade<S: Into<String>>(msg: S) -> Self {
        Error::Upgrade(msg.into())
    }

    pub fn http<S: Into<String>>(msg: S) -> Self {
        Error::Http(msg.into())
    }

    pub fn invalid_frame<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFrame(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn invalid_response<S: Into<String>>(msg: S) -> Self {
        Error::InvalidResponse(msg.into())
    }

    pub fn invalid_url<S: Into<String>>(msg: S) -> Self {
        Error::InvalidUrl(msg.into())
    }

    pub fn setup<S: Into<String>>(msg: S) -> Self {
        Error::Setup(msg.into())
    }

    pub fn send<S: Into<String>>(msg: S) -> Self {
        Error::Send(msg.into())
    }

    pub fn receive<S: Into<String>>(msg: S) -> Self {
        Error::Receive(msg.into())
    }

    /// Whether the error is swallowed instead of being reported upward.
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::Dropped)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidUrl(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::handshake("bad server hello");
        assert!(matches!(e, Error::Handshake(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::protocol("invalid header");
        assert_eq!(e.to_string(), "Protocol error: invalid header");
    }

    #[test]
    fn test_dropped_is_silent() {
        assert!(Error::Dropped.is_silent());
        assert!(!Error::NotConnected.is_silent());
    }
}
