//! Configuration module
//!
//! One `Config` describes one outbound endpoint; it is immutable for the
//! lifetime of every connection built from it. The persisted form is JSON
//! (see [`Config::load`]); `vless://` share links parse into the same
//! structure via [`link::parse_share_link`].

pub mod link;

pub use link::parse_share_link;

use crate::common::Address;
use crate::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use uuid::Uuid;

/// Default Vision padding seed: `[contentThreshold, longPaddingMax,
/// longPaddingBase, shortPaddingMax]`
pub const DEFAULT_PADDING_SEED: [u32; 4] = [900, 500, 900, 256];

/// Stream transport selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Ws,
    #[serde(rename = "httpupgrade")]
    HttpUpgrade,
    Xhttp,
}

impl TryFrom<&str> for TransportKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" | "" => Ok(TransportKind::Tcp),
            "ws" => Ok(TransportKind::Ws),
            "httpupgrade" => Ok(TransportKind::HttpUpgrade),
            "xhttp" => Ok(TransportKind::Xhttp),
            _ => Err(Error::config(format!("Unknown transport type: {}", s))),
        }
    }
}

/// XHTTP upload mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum XhttpMode {
    #[default]
    Auto,
    PacketUp,
    StreamOne,
}

impl TryFrom<&str> for XhttpMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" | "" => Ok(XhttpMode::Auto),
            "packet-up" => Ok(XhttpMode::PacketUp),
            "stream-one" => Ok(XhttpMode::StreamOne),
            _ => Err(Error::config(format!("Unknown xhttp mode: {}", s))),
        }
    }
}

/// VLESS flow selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Flow {
    #[default]
    None,
    Vision,
    VisionUdp443,
}

impl Flow {
    /// The flow string carried in the VLESS request addons, if any.
    pub fn addon_name(&self) -> Option<&'static str> {
        match self {
            Flow::None => None,
            Flow::Vision | Flow::VisionUdp443 => Some("xtls-rprx-vision"),
        }
    }

    pub fn is_vision(&self) -> bool {
        !matches!(self, Flow::None)
    }
}

impl TryFrom<&str> for Flow {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Flow::None),
            "vision" | "xtls-rprx-vision" => Ok(Flow::Vision),
            "vision-udp443" | "xtls-rprx-vision-udp443" => Ok(Flow::VisionUdp443),
            _ => Err(Error::config(format!("Unknown flow: {}", s))),
        }
    }
}

/// Outer security selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl TryFrom<&str> for Security {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(Security::None),
            "tls" => Ok(Security::Tls),
            "reality" => Ok(Security::Reality),
            _ => Err(Error::config(format!("Unknown security: {}", s))),
        }
    }
}

/// ClientHello browser fingerprint selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Fingerprint {
    #[default]
    Chrome,
    Firefox,
    Safari,
    Ios,
    Edge,
    Random,
}

impl TryFrom<&str> for Fingerprint {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "chrome" => Ok(Fingerprint::Chrome),
            "firefox" => Ok(Fingerprint::Firefox),
            "safari" => Ok(Fingerprint::Safari),
            "ios" => Ok(Fingerprint::Ios),
            "edge" => Ok(Fingerprint::Edge),
            "random" => Ok(Fingerprint::Random),
            _ => Err(Error::config(format!("Unknown fingerprint: {}", s))),
        }
    }
}

/// TLS sub-config
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    pub sni: String,
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
    pub fingerprint: Fingerprint,
}

/// Reality sub-config
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RealityConfig {
    pub server_name: String,
    /// Server long-term X25519 public key, base64url without padding
    pub public_key: String,
    /// Short id, hex, at most 8 bytes
    pub short_id: String,
    pub fingerprint: Fingerprint,
}

impl RealityConfig {
    pub fn public_key_bytes(&self) -> Result<[u8; 32]> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&self.public_key)
            .map_err(|_| Error::config("Invalid Reality public key encoding"))?;
        raw.try_into()
            .map_err(|_| Error::config("Reality public key must be 32 bytes"))
    }

    pub fn short_id_bytes(&self) -> Result<Vec<u8>> {
        let raw = hex::decode(&self.short_id)
            .map_err(|_| Error::config("Invalid Reality short id hex"))?;
        if raw.len() > 8 {
            return Err(Error::config("Reality short id longer than 8 bytes"));
        }
        Ok(raw)
    }
}

/// WebSocket sub-config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WsConfig {
    pub host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub max_early_data: usize,
    pub early_data_header_name: String,
}

impl Default for WsConfig {
    fn default() -> Self {
        WsConfig {
            host: String::new(),
            path: "/".to_string(),
            headers: HashMap::new(),
            max_early_data: 0,
            early_data_header_name: "Sec-WebSocket-Protocol".to_string(),
        }
    }
}

/// HTTP-Upgrade sub-config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpUpgradeConfig {
    pub host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl Default for HttpUpgradeConfig {
    fn default() -> Self {
        HttpUpgradeConfig {
            host: String::new(),
            path: "/".to_string(),
            headers: HashMap::new(),
        }
    }
}

/// XHTTP sub-config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct XhttpConfig {
    pub host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Send `Content-Type: application/grpc` on uploads
    pub grpc_header: bool,
    pub sc_max_each_post_bytes: usize,
    pub sc_min_posts_interval_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for XhttpConfig {
    fn default() -> Self {
        XhttpConfig {
            host: String::new(),
            path: "/".to_string(),
            headers: HashMap::new(),
            grpc_header: false,
            sc_max_each_post_bytes: 1_000_000,
            sc_min_posts_interval_ms: 30,
            user_agent: None,
        }
    }
}

/// One outbound endpoint, immutable per connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Display name (share-link fragment)
    pub name: String,

    /// Server host (domain or IP literal)
    pub server: String,

    /// Server port
    pub port: u16,

    /// Pre-resolved server address; skips DNS when present.
    /// Legacy records omit this field.
    #[serde(rename = "resolvedIP")]
    pub resolved_ip: Option<IpAddr>,

    /// User credential
    pub uuid: Uuid,

    /// Encryption selector; only "none" is recognized
    pub encryption: String,

    pub transport: TransportKind,

    pub xhttp_mode: XhttpMode,

    pub flow: Flow,

    pub security: Security,

    pub tls: TlsConfig,

    pub reality: RealityConfig,

    pub ws: WsConfig,

    pub http_upgrade: HttpUpgradeConfig,

    pub xhttp: XhttpConfig,

    /// Vision padding seed
    #[serde(rename = "testseed")]
    pub padding_seed: [u32; 4],

    pub mux_enabled: bool,

    /// Legacy records omit this field.
    pub xudp_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: String::new(),
            server: String::new(),
            port: 443,
            resolved_ip: None,
            uuid: Uuid::nil(),
            encryption: "none".to_string(),
            transport: TransportKind::Tcp,
            xhttp_mode: XhttpMode::Auto,
            flow: Flow::None,
            security: Security::None,
            tls: TlsConfig::default(),
            reality: RealityConfig::default(),
            ws: WsConfig::default(),
            http_upgrade: HttpUpgradeConfig::default(),
            xhttp: XhttpConfig::default(),
            padding_seed: DEFAULT_PADDING_SEED,
            mux_enabled: true,
            xudp_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate field combinations
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("Missing server address"));
        }
        if self.port == 0 {
            return Err(Error::config("Invalid server port 0"));
        }
        if self.encryption != "none" {
            return Err(Error::config(format!(
                "Unsupported encryption: {}",
                self.encryption
            )));
        }
        if self.security == Security::Reality {
            if self.reality.server_name.is_empty() {
                return Err(Error::config("Reality requires a server name"));
            }
            self.reality.public_key_bytes()?;
            self.reality.short_id_bytes()?;
        }
        if self.flow.is_vision() && self.security == Security::None {
            return Err(Error::config("Vision flow requires TLS or Reality"));
        }
        Ok(())
    }

    /// Server endpoint as an [`Address`]
    pub fn server_address(&self) -> Result<Address> {
        match self.resolved_ip {
            Some(ip) => Ok(Address::Ip(std::net::SocketAddr::new(ip, self.port))),
            None => Address::new(&self.server, self.port),
        }
    }

    /// Resolve `auto` against the active security layer: Reality forces
    /// stream semantics (the connection runs HTTP/2); plain TLS or no TLS
    /// defaults to the CDN-friendly packet-up.
    pub fn effective_xhttp_mode(&self) -> XhttpMode {
        match self.xhttp_mode {
            XhttpMode::Auto => {
                if self.security == Security::Reality {
                    XhttpMode::StreamOne
                } else {
                    XhttpMode::PacketUp
                }
            }
            mode => mode,
        }
    }

    /// The SNI / host header to present for the outer security layer
    pub fn outer_server_name(&self) -> String {
        match self.security {
            Security::Reality => self.reality.server_name.clone(),
            _ => {
                if self.tls.sni.is_empty() {
                    self.server.clone()
                } else {
                    self.tls.sni.clone()
                }
            }
        }
    }

    /// Fingerprint for the active security layer
    pub fn effective_fingerprint(&self) -> Fingerprint {
        match self.security {
            Security::Reality => self.reality.fingerprint,
            _ => self.tls.fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.encryption, "none");
        assert_eq!(config.padding_seed, [900, 500, 900, 256]);
        assert!(config.mux_enabled);
        assert!(config.xudp_enabled);
        assert_eq!(config.ws.early_data_header_name, "Sec-WebSocket-Protocol");
    }

    #[test]
    fn test_legacy_json_defaults() {
        // Legacy records omit xudpEnabled and resolvedIP
        let json = r#"{
            "server": "proxy.example.com",
            "port": 443,
            "uuid": "11111111-2222-3333-4444-555555555555",
            "security": "tls",
            "transport": "ws"
        }"#;
        let config = Config::from_json(json).unwrap();
        assert!(config.xudp_enabled);
        assert!(config.resolved_ip.is_none());
        assert_eq!(config.transport, TransportKind::Ws);
        assert_eq!(config.security, Security::Tls);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = Config {
            server: "203.0.113.1".to_string(),
            port: 8443,
            uuid: Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap(),
            security: Security::Reality,
            ..Config::default()
        };
        config.reality.server_name = "www.example.com".to_string();
        config.reality.public_key =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([7u8; 32]);
        config.reality.short_id = "abcd".to_string();

        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.server, config.server);
        assert_eq!(parsed.reality.public_key_bytes().unwrap(), [7u8; 32]);
        assert_eq!(parsed.reality.short_id_bytes().unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_xhttp_auto_resolution() {
        let mut config = Config {
            server: "example.com".to_string(),
            transport: TransportKind::Xhttp,
            ..Config::default()
        };
        assert_eq!(config.effective_xhttp_mode(), XhttpMode::PacketUp);

        config.security = Security::Reality;
        assert_eq!(config.effective_xhttp_mode(), XhttpMode::StreamOne);

        config.xhttp_mode = XhttpMode::PacketUp;
        assert_eq!(config.effective_xhttp_mode(), XhttpMode::PacketUp);
    }

    #[test]
    fn test_vision_requires_security() {
        let config = Config {
            server: "example.com".to_string(),
            flow: Flow::Vision,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flow_addon_name() {
        assert_eq!(Flow::None.addon_name(), None);
        assert_eq!(Flow::Vision.addon_name(), Some("xtls-rprx-vision"));
        assert_eq!(Flow::VisionUdp443.addon_name(), Some("xtls-rprx-vision"));
    }
}
