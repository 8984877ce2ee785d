//! Tungate - CLI self-check
//!
//! Builds the configured outbound pipeline exactly as the tunnel would for
//! one TCP flow and probes an origin through it. Useful for validating an
//! endpoint without a TUN device.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tungate::common::Address;
use tungate::config::parse_share_link;
use tungate::dns::Resolver;
use tungate::outbound::Outbound;
use tungate::{Config, Error, Result, VERSION};

#[derive(Parser, Debug)]
#[command(name = "tungate")]
#[command(version = VERSION)]
#[command(about = "TUN-to-VLESS outbound data plane self-check")]
struct Args {
    /// Path to a persisted JSON configuration
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// vless:// share link (alternative to --config)
    #[arg(short = 'l', long = "link")]
    link: Option<String>,

    /// Origin to probe through the tunnel, host:port
    #[arg(long = "probe", default_value = "cp.cloudflare.com:80")]
    probe: String,

    /// Validate configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tungate-worker")
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tungate=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("Tungate v{}", VERSION);

    let config = load_config(&args)?;
    info!(
        "Endpoint {} ({}:{}), security {:?}, transport {:?}",
        if config.name.is_empty() { "unnamed" } else { &config.name },
        config.server,
        config.port,
        config.security,
        config.transport
    );

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let (host, port) = args
        .probe
        .rsplit_once(':')
        .ok_or_else(|| Error::config("Probe must be host:port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::config("Invalid probe port"))?;
    let target = Address::new(host, port)?;

    let outbound = Outbound::new(Arc::new(config), Arc::new(Resolver::new()));
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host
    );

    info!("Probing {} through the tunnel...", target);
    let mut stream = match outbound.dial_tcp(&target, Some(request.into_bytes().into())).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Dial failed: {}", e);
            return Err(e);
        }
    };

    let mut response = Vec::new();
    while !response.windows(2).any(|w| w == b"\r\n") {
        match stream.receive().await? {
            Some(chunk) => response.extend_from_slice(&chunk),
            None => break,
        }
        if response.len() > 16 * 1024 {
            break;
        }
    }
    stream.close().await;

    match response.split(|b| *b == b'\n').next() {
        Some(line) if !line.is_empty() => {
            info!("Probe response: {}", String::from_utf8_lossy(line).trim_end());
            Ok(())
        }
        _ => {
            error!("Probe returned no data");
            Err(Error::receive("Empty probe response"))
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    if let Some(link) = &args.link {
        return parse_share_link(link);
    }
    if let Some(path) = &args.config {
        return Config::load(path);
    }
    Err(Error::config("Provide --link or --config"))
}
