//! User-space IP stack collaborator interface
//!
//! The stack itself (lwIP-style) lives outside this crate; the tunnel binds
//! to it through this trait plus an event channel. Catch-all TCP and UDP
//! listeners on the wildcard port feed accepts and datagrams in; the trait
//! methods drive packets back out. Implementations must serialize stack
//! access internally; the tunnel calls from per-flow tasks. Multi-segment
//! packet buffers must be copied to contiguous memory before an event is
//! emitted.

use crate::Result;
use bytes::Bytes;
use std::net::SocketAddr;

/// Opaque protocol control block handle, valid until close or abort
pub type PcbId = u64;

/// Events delivered by the stack to the tunnel
#[derive(Debug)]
pub enum StackEvent {
    /// New TCP connection accepted by the catch-all listener
    TcpAccept {
        pcb: PcbId,
        src: SocketAddr,
        dst: SocketAddr,
    },
    /// Data from the local peer; `None` means the peer half-closed
    TcpRecv { pcb: PcbId, data: Option<Bytes> },
    /// The stack acknowledged `len` bytes of previously written data,
    /// freeing send-buffer space
    TcpSent { pcb: PcbId, len: usize },
    /// Fatal PCB error; the handle is already invalid
    TcpError { pcb: PcbId },
    /// One UDP datagram from the local peer
    UdpRecv {
        src: SocketAddr,
        dst: SocketAddr,
        payload: Bytes,
    },
}

/// Calls from the tunnel into the stack
pub trait NetStack: Send + Sync {
    /// Queue `data` on the PCB (the stack copies it out)
    fn tcp_write(&self, pcb: PcbId, data: &[u8]) -> Result<()>;

    /// Flush queued segments
    fn tcp_output(&self, pcb: PcbId);

    /// Advance the receive window by `len` bytes (the backpressure hook)
    fn tcp_recved(&self, pcb: PcbId, len: usize);

    /// Free space in the PCB send buffer
    fn tcp_sndbuf(&self, pcb: PcbId) -> usize;

    /// Graceful close (FIN)
    fn tcp_close(&self, pcb: PcbId);

    /// Abortive close; fires no further events for the PCB
    fn tcp_abort(&self, pcb: PcbId);

    /// Send a UDP datagram bypassing routing (`src` must be the original
    /// destination of the flow so the response appears to come from it)
    fn udp_sendto(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]);

    /// Periodic stack timer processing
    fn check_timeouts(&self);
}
