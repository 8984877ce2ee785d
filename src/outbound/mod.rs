//! Outbound pipeline construction
//!
//! Builds the layered stack for each flow: socket → (TLS | Reality | none)
//! → (WebSocket | HTTP-Upgrade | XHTTP | raw) → VLESS → (Vision | mux |
//! plain), with a per-dial retry policy and the Vision/XHTTP composition
//! rules.

pub mod mux;
pub mod vision;
pub mod vless;

pub use mux::{MuxClient, MuxSession, MuxSessionRx, MuxSessionTx};

use crate::common::Address;
use crate::config::{Config, Flow, Security, TransportKind, XhttpMode};
use crate::dns::Resolver;
use crate::tls::{client as tls_client, reality};
use crate::transport::xhttp::Dialer;
use crate::transport::{h2, httpupgrade, tcp, ws, xhttp, Stream, TlsVersion};
use crate::{Error, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Dial attempts per pipeline flavor
const RETRY_ATTEMPTS: u32 = 5;

/// Linear backoff step between attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Per-endpoint outbound dialer; shared by all flows of one tunnel
pub struct Outbound {
    config: Arc<Config>,
    resolver: Arc<Resolver>,
    /// Shared mux client for non-XUDP sessions, built lazily
    shared_mux: Mutex<Option<MuxClient>>,
}

impl Outbound {
    pub fn new(config: Arc<Config>, resolver: Arc<Resolver>) -> Self {
        Outbound {
            config,
            resolver,
            shared_mux: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// TCP flows ride the shared mux only when Vision is off (Vision shapes
    /// the raw VLESS-TCP stream).
    pub fn uses_mux_for_tcp(&self) -> bool {
        self.config.mux_enabled && !self.config.flow.is_vision()
    }

    /// UDP flows ride a mux session whenever mux is enabled or Vision is
    /// active; otherwise each flow gets its own VLESS-UDP connection.
    pub fn uses_mux_for_udp(&self) -> bool {
        self.config.mux_enabled || self.config.flow.is_vision()
    }

    /// `flow=vision` silently drops UDP to port 443 (QUIC);
    /// `vision-udp443` allows it.
    pub fn check_udp_policy(&self, target: &Address) -> Result<()> {
        if self.config.flow == Flow::Vision && target.port() == 443 {
            return Err(Error::Dropped);
        }
        Ok(())
    }

    /// Dial a full VLESS-TCP pipeline to `target`, sending the request
    /// header together with `initial` (Vision pairs the header with an
    /// empty padding frame when there is no initial data).
    pub async fn dial_tcp(&self, target: &Address, initial: Option<Bytes>) -> Result<Stream> {
        self.check_vision_composition()?;
        let stream = self.connect_transport_retry().await?;

        if self.config.flow.is_vision() {
            if stream.tls_version() != Some(TlsVersion::Tls13) {
                return Err(Error::protocol("Vision requires an outer TLS 1.3 layer"));
            }
            let vless = vless::wrap(
                stream,
                &self.config.uuid,
                self.config.flow.addon_name(),
                vless::CMD_TCP,
                Some(target),
            );
            let mut shaped = vision::wrap(vless, &self.config.uuid, self.config.padding_seed);
            // Never let the request header travel alone
            shaped.send(initial.unwrap_or_default()).await?;
            return Ok(shaped);
        }

        let mut stream = vless::wrap(
            stream,
            &self.config.uuid,
            None,
            vless::CMD_TCP,
            Some(target),
        );
        if let Some(initial) = initial {
            stream.send(initial).await?;
        }
        Ok(stream)
    }

    /// Dial a dedicated VLESS-UDP pipeline to `target`
    pub async fn dial_udp(&self, target: &Address) -> Result<Stream> {
        self.check_udp_policy(target)?;
        let stream = self.connect_transport_retry().await?;
        Ok(vless::wrap_udp(stream, &self.config.uuid, None, target))
    }

    /// Open a TCP sub-stream on the shared mux client
    pub async fn open_mux_tcp(&self, target: Address) -> Result<MuxSession> {
        let client = self.shared_mux_client().await?;
        client.open_tcp(target).await
    }

    /// Open a UDP sub-stream. XUDP gets a dedicated client per flow with
    /// the flow's GlobalID; otherwise the shared client carries it.
    pub async fn open_mux_udp(
        &self,
        target: Address,
        source: (String, u16),
    ) -> Result<MuxSession> {
        self.check_udp_policy(&target)?;
        if self.config.xudp_enabled {
            let outer = self.build_mux_outer().await?;
            let client = MuxClient::new(outer, true);
            return client.open_udp(target, Some(source)).await;
        }
        let client = self.shared_mux_client().await?;
        client.open_udp(target, None).await
    }

    async fn shared_mux_client(&self) -> Result<MuxClient> {
        let mut guard = self.shared_mux.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() && !client.is_full() {
                return Ok(client.clone());
            }
        }
        let outer = self.build_mux_outer().await?;
        let client = MuxClient::new(outer, false);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// The outer connection of a mux client: VLESS with command=mux (the
    /// conventional `v1.mux.cool:666` target stays off the wire), Vision
    /// wrapped when the flow asks for it.
    async fn build_mux_outer(&self) -> Result<Stream> {
        self.check_vision_composition()?;
        let stream = self.connect_transport_retry().await?;

        if self.config.flow.is_vision() {
            if stream.tls_version() != Some(TlsVersion::Tls13) {
                return Err(Error::protocol("Vision requires an outer TLS 1.3 layer"));
            }
            let vless = vless::wrap(
                stream,
                &self.config.uuid,
                self.config.flow.addon_name(),
                vless::CMD_MUX,
                None,
            );
            return Ok(vision::wrap(
                vless,
                &self.config.uuid,
                self.config.padding_seed,
            ));
        }

        Ok(vless::wrap(
            stream,
            &self.config.uuid,
            None,
            vless::CMD_MUX,
            None,
        ))
    }

    /// Vision composes only over TLS 1.3-capable security layers; the
    /// plaintext stream transports are rejected before any dialing.
    fn check_vision_composition(&self) -> Result<()> {
        if self.config.flow.is_vision() && self.config.transport != TransportKind::Tcp {
            return Err(Error::protocol(
                "Vision flow requires the tcp transport with TLS or Reality",
            ));
        }
        Ok(())
    }

    /// Retry loop around one pipeline flavor: 5 attempts, linear backoff
    /// 0/200/400/600/800 ms. A silent drop never retries.
    async fn connect_transport_retry(&self) -> Result<Stream> {
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            match connect_transport(&self.config, &self.resolver).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_silent() => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] dial attempt {}/{} failed: {}",
                        self.config.name,
                        attempt + 1,
                        RETRY_ATTEMPTS,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connection("Dial failed")))
    }
}

/// Candidate socket addresses for the server endpoint
async fn resolve_candidates(config: &Config, resolver: &Resolver) -> Result<Vec<SocketAddr>> {
    if let Some(ip) = config.resolved_ip {
        return Ok(vec![SocketAddr::new(ip, config.port)]);
    }
    let ips = resolver.resolve(&config.server).await?;
    Ok(ips
        .into_iter()
        .map(|ip| SocketAddr::new(ip, config.port))
        .collect())
}

/// socket → security; the base every adapter builds on
async fn connect_secured(config: &Config, resolver: &Resolver) -> Result<Stream> {
    let addrs = resolve_candidates(config, resolver).await?;
    let stream = tcp::connect(&addrs).await?;

    match config.security {
        Security::None => Ok(stream),
        Security::Tls => {
            let alpn = if config.transport == TransportKind::Xhttp {
                // XHTTP over standard TLS always negotiates HTTP/1.1
                Some(vec!["http/1.1".to_string()])
            } else if config.tls.alpn.is_empty() {
                None
            } else {
                Some(config.tls.alpn.clone())
            };
            tls_client::connect(
                stream,
                &tls_client::TlsOptions {
                    server_name: config.outer_server_name(),
                    alpn,
                    fingerprint: config.effective_fingerprint(),
                    allow_insecure: config.tls.allow_insecure,
                },
            )
            .await
        }
        Security::Reality => {
            reality::connect(
                stream,
                &reality::RealityOptions {
                    server_name: config.reality.server_name.clone(),
                    public_key: config.reality.public_key_bytes()?,
                    short_id: config.reality.short_id_bytes()?,
                    fingerprint: config.reality.fingerprint,
                    alpn: if config.tls.alpn.is_empty() {
                        None
                    } else {
                        Some(config.tls.alpn.clone())
                    },
                },
            )
            .await
        }
    }
}

/// One full attempt: socket → security → stream transport
async fn connect_transport(config: &Config, resolver: &Resolver) -> Result<Stream> {
    let stream = connect_secured(config, resolver).await?;

    match config.transport {
        TransportKind::Tcp => Ok(stream),
        TransportKind::Ws => {
            let host = non_empty(&config.ws.host, &config.server);
            let (stream, _) = ws::connect(stream, &host, &config.ws, &[]).await?;
            Ok(stream)
        }
        TransportKind::HttpUpgrade => {
            let host = non_empty(&config.http_upgrade.host, &config.server);
            httpupgrade::connect(stream, &host, &config.http_upgrade).await
        }
        TransportKind::Xhttp => {
            let host = non_empty(&config.xhttp.host, &config.server);
            if config.security == Security::Reality {
                // Reality forces the HTTP/2 rendition regardless of mode
                return h2::connect(stream, &host, &config.xhttp).await;
            }
            match config.effective_xhttp_mode() {
                XhttpMode::StreamOne => {
                    xhttp::connect_stream_one(stream, &host, &config.xhttp).await
                }
                _ => {
                    let dialer = upload_dialer(config, resolver);
                    xhttp::connect_packet_up(stream, dialer, host, config.xhttp.clone()).await
                }
            }
        }
    }
}

/// Factory for packet-up upload connections (socket + security only)
fn upload_dialer(config: &Config, resolver: &Resolver) -> Dialer {
    let config = config.clone();
    let resolver = resolver.clone();
    Box::new(move || {
        let config = config.clone();
        let resolver = resolver.clone();
        Box::pin(async move {
            debug!("[{}] dialing XHTTP upload connection", config.name);
            connect_secured(&config, &resolver).await
        })
    })
}

fn non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}
