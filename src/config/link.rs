//! `vless://` share-link parsing
//!
//! Grammar: `vless://{uuid}@{host}:{port}[/]?{key=value&...}#{name}`

use super::{Config, Fingerprint, Flow, Security, TransportKind, XhttpMode};
use crate::{Error, Result};
use percent_encoding::percent_decode_str;
use url::Url;
use uuid::Uuid;

/// Parse a share link into a full [`Config`]
pub fn parse_share_link(link: &str) -> Result<Config> {
    let url = Url::parse(link)?;
    if url.scheme() != "vless" {
        return Err(Error::invalid_url(format!(
            "Unsupported scheme: {}",
            url.scheme()
        )));
    }

    let uuid_str = percent_decode_str(url.username())
        .decode_utf8()
        .map_err(|_| Error::invalid_url("Malformed user info"))?;
    let uuid = Uuid::parse_str(&uuid_str)
        .map_err(|e| Error::invalid_url(format!("Invalid UUID: {}", e)))?;

    let host = url
        .host_str()
        .ok_or_else(|| Error::invalid_url("Missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| Error::invalid_url("Missing port"))?;

    let mut config = Config {
        server: host,
        port,
        uuid,
        mux_enabled: true,
        xudp_enabled: true,
        ..Config::default()
    };

    if let Some(fragment) = url.fragment() {
        config.name = percent_decode_str(fragment)
            .decode_utf8()
            .map_err(|_| Error::invalid_url("Malformed fragment"))?
            .replace('+', " ");
    }

    let mut host_override = None;
    let mut path_override = None;

    for (key, value) in url.query_pairs() {
        let value = value.into_owned();
        match key.as_ref() {
            "encryption" => {
                if !value.is_empty() {
                    config.encryption = value;
                }
            }
            "flow" => config.flow = Flow::try_from(value.as_str())?,
            "security" => config.security = Security::try_from(value.as_str())?,
            "type" => config.transport = TransportKind::try_from(value.as_str())?,
            "sni" => {
                config.tls.sni = value.clone();
                config.reality.server_name = value;
            }
            "pbk" => config.reality.public_key = value,
            "sid" => config.reality.short_id = value,
            "fp" => {
                let fp = Fingerprint::try_from(value.as_str())?;
                config.tls.fingerprint = fp;
                config.reality.fingerprint = fp;
            }
            "alpn" => {
                config.tls.alpn = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
            }
            "allowInsecure" => {
                config.tls.allow_insecure = matches!(value.as_str(), "1" | "true");
            }
            "host" => host_override = Some(value),
            "path" => path_override = Some(value),
            "ed" => {
                config.ws.max_early_data = value
                    .parse()
                    .map_err(|_| Error::invalid_url("Invalid ed value"))?;
            }
            "eh" => config.ws.early_data_header_name = value,
            "mode" => config.xhttp_mode = XhttpMode::try_from(value.as_str())?,
            "mux" => config.mux_enabled = !matches!(value.as_str(), "false" | "0"),
            "xudp" => config.xudp_enabled = !matches!(value.as_str(), "false" | "0"),
            "testseed" => {
                let seed: Vec<u32> = value
                    .split(',')
                    .map(|s| s.trim().parse::<u32>())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| Error::invalid_url("Invalid testseed list"))?;
                config.padding_seed = seed
                    .try_into()
                    .map_err(|_| Error::invalid_url("testseed needs exactly 4 values"))?;
            }
            _ => {}
        }
    }

    if let Some(host) = host_override {
        config.ws.host = host.clone();
        config.http_upgrade.host = host.clone();
        config.xhttp.host = host;
    }
    if let Some(path) = path_override {
        config.ws.path = path.clone();
        config.http_upgrade.path = path.clone();
        config.xhttp.path = path;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_link() {
        let config = parse_share_link(
            "vless://11111111-2222-3333-4444-555555555555@203.0.113.1:12345#Node%201",
        )
        .unwrap();
        assert_eq!(config.server, "203.0.113.1");
        assert_eq!(config.port, 12345);
        assert_eq!(config.name, "Node 1");
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.security, Security::None);
        assert!(config.mux_enabled);
    }

    #[test]
    fn test_reality_link() {
        let link = "vless://11111111-2222-3333-4444-555555555555@example.com:443\
                    ?security=reality&sni=www.example.org&fp=safari\
                    &pbk=BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc&sid=01ab&flow=xtls-rprx-vision";
        let config = parse_share_link(link).unwrap();
        assert_eq!(config.security, Security::Reality);
        assert_eq!(config.reality.server_name, "www.example.org");
        assert_eq!(config.reality.fingerprint, Fingerprint::Safari);
        assert_eq!(config.reality.short_id_bytes().unwrap(), vec![0x01, 0xAB]);
        assert_eq!(config.flow, Flow::Vision);
        assert_eq!(config.reality.public_key_bytes().unwrap(), [7u8; 32]);
    }

    #[test]
    fn test_ws_link_with_early_data() {
        let link = "vless://11111111-2222-3333-4444-555555555555@example.com:443\
                    ?type=ws&security=tls&host=cdn.example.com&path=%2Ftunnel&ed=2048&mux=false";
        let config = parse_share_link(link).unwrap();
        assert_eq!(config.transport, TransportKind::Ws);
        assert_eq!(config.ws.host, "cdn.example.com");
        assert_eq!(config.ws.path, "/tunnel");
        assert_eq!(config.ws.max_early_data, 2048);
        assert!(!config.mux_enabled);
    }

    #[test]
    fn test_testseed_list() {
        let link = "vless://11111111-2222-3333-4444-555555555555@example.com:443\
                    ?security=tls&testseed=100,200,300,400";
        let config = parse_share_link(link).unwrap();
        assert_eq!(config.padding_seed, [100, 200, 300, 400]);
    }

    #[test]
    fn test_rejects_bad_scheme() {
        assert!(parse_share_link("vmess://x@y:1").is_err());
    }

    #[test]
    fn test_rejects_bad_testseed() {
        let link = "vless://11111111-2222-3333-4444-555555555555@example.com:443\
                    ?testseed=1,2,3";
        assert!(parse_share_link(link).is_err());
    }

    #[test]
    fn test_ipv6_host() {
        let config = parse_share_link(
            "vless://11111111-2222-3333-4444-555555555555@[2001:db8::5]:443?security=tls",
        )
        .unwrap();
        assert_eq!(config.server, "2001:db8::5");
    }
}
