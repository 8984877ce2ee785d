//! DNS resolution for the server endpoint
//!
//! The data plane only ever resolves the proxy server itself; flow targets
//! travel to the server as domains. A pre-resolved IP from the configuration
//! bypasses lookup entirely (the host excludes that address from tunnel
//! routes, so resolving it again could loop through the tunnel).

use crate::{Error, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use tracing::debug;

/// Server-endpoint resolver
#[derive(Clone)]
pub struct Resolver {
    resolver: TokioAsyncResolver,
}

impl Resolver {
    /// Resolver backed by Cloudflare public DNS (the tunnel's configured
    /// upstream, see `tunnel::CLOUDFLARE_DNS`).
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default());
        Resolver { resolver }
    }

    /// Resolve a host to an ordered candidate list. IP literals short-circuit.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::resolution(format!("{}: {}", host, e)))?;

        // Prefer IPv4; keep IPv6 as fallback candidates.
        let mut v4: Vec<IpAddr> = Vec::new();
        let mut v6: Vec<IpAddr> = Vec::new();
        for ip in response.iter() {
            match ip {
                IpAddr::V4(_) => v4.push(ip),
                IpAddr::V6(_) => v6.push(ip),
            }
        }
        v4.extend(v6);

        if v4.is_empty() {
            return Err(Error::resolution(format!("{}: no addresses", host)));
        }
        debug!("Resolved {} to {} addresses", host, v4.len());
        Ok(v4)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literal_short_circuit() {
        let resolver = Resolver::new();
        let addrs = resolver.resolve("203.0.113.9").await.unwrap();
        assert_eq!(addrs, vec!["203.0.113.9".parse::<IpAddr>().unwrap()]);
    }
}
