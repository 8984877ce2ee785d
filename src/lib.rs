//! Tungate - client-side TUN-to-VLESS outbound proxy data plane
//!
//! The crate terminates TCP and UDP flows handed over by a user-space IP
//! stack and relays each flow to a remote VLESS server over a layered
//! transport stack, with optional XTLS Vision traffic shaping and mux
//! multiplexing (XUDP for UDP).
//!
//! # Architecture
//!
//! ```text
//!  +-------------+      +----------------------------------------+
//!  |  tunnel/    |      |               outbound/                |
//!  | (IP-stack   +------>  pipeline builder, VLESS framing,      |
//!  |  bridge,    |      |  Vision shaping, mux multiplexer       |
//!  |  flows)     |      +-------------------+--------------------+
//!  +-------------+                          |
//!                       +-------------------v--------------------+
//!                       |              transport/                |
//!                       |  tcp | ws | httpupgrade | xhttp | h2   |
//!                       +-------------------+--------------------+
//!                                           |
//!                       +-------------------v--------------------+
//!                       |                 tls/                   |
//!                       |  TLS 1.3 client | Reality | records    |
//!                       +----------------------------------------+
//! ```
//!
//! The flow of a connection: the IP stack hands a new TCP PCB or UDP
//! 5-tuple to the tunnel; the tunnel asks `outbound` to build the layered
//! pipeline and then relays bytes in both directions with backpressure and
//! inactivity supervision.

pub mod common;
pub mod config;
pub mod dns;
pub mod outbound;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;
pub use tunnel::Tunnel;

/// Crate version
pub const VERSION: &str = "0.4.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
