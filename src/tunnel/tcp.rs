//! Per-connection TCP flow
//!
//! One task owns each accepted PCB: it relays local bytes to the remote
//! pipeline (advancing the stack receive window only after the remote write
//! completes) and remote bytes into the stack send buffer, spilling into an
//! overflow buffer when the window is full. While the overflow is non-empty
//! the remote receive loop makes no progress.

use super::stack::{NetStack, PcbId};
use super::timer::{ActivityTimer, CONNECTION_IDLE, HALF_CLOSED_IDLE};
use super::TrafficCounters;
use crate::outbound::{MuxSessionRx, MuxSessionTx};
use crate::transport::{BoxRx, BoxTx};
use crate::Result;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events routed to a flow by the tunnel dispatcher
#[derive(Debug)]
pub(crate) enum FlowEvent {
    /// Local bytes; `None` means the local peer half-closed the uplink
    Recv(Option<Bytes>),
    /// The stack freed send-buffer space
    Sent(usize),
    /// The PCB died; its handle is already invalid
    Error,
    /// Inactivity timer fired
    Timeout,
}

/// Remote write half: a dedicated pipeline or a mux sub-stream
pub(crate) enum RemoteTx {
    Stream(BoxTx),
    Mux(MuxSessionTx),
}

impl RemoteTx {
    pub(crate) async fn send(&mut self, data: Bytes) -> Result<()> {
        match self {
            RemoteTx::Stream(tx) => tx.send(data).await,
            RemoteTx::Mux(tx) => tx.send(&data).await,
        }
    }

    pub(crate) async fn close(&mut self) {
        match self {
            RemoteTx::Stream(tx) => tx.close().await,
            RemoteTx::Mux(tx) => tx.close().await,
        }
    }
}

/// Remote read half
pub(crate) enum RemoteRx {
    Stream(BoxRx),
    Mux(MuxSessionRx),
}

impl RemoteRx {
    pub(crate) async fn receive(&mut self) -> Result<Option<Bytes>> {
        match self {
            RemoteRx::Stream(rx) => rx.receive().await,
            RemoteRx::Mux(rx) => Ok(rx.recv().await),
        }
    }
}

/// Write as much of `data` as the stack send buffer accepts; the remainder
/// lands in `overflow`.
fn push_downlink(stack: &dyn NetStack, pcb: PcbId, overflow: &mut BytesMut, data: &[u8]) {
    let room = stack.tcp_sndbuf(pcb);
    let n = room.min(data.len());
    if n > 0 && stack.tcp_write(pcb, &data[..n]).is_ok() {
        stack.tcp_output(pcb);
        if n < data.len() {
            overflow.extend_from_slice(&data[n..]);
        }
        return;
    }
    overflow.extend_from_slice(data);
}

/// Move freed send-buffer space worth of overflow into the stack
fn drain_overflow(stack: &dyn NetStack, pcb: PcbId, overflow: &mut BytesMut) {
    if overflow.is_empty() {
        return;
    }
    let room = stack.tcp_sndbuf(pcb);
    let n = room.min(overflow.len());
    if n > 0 && stack.tcp_write(pcb, &overflow[..n]).is_ok() {
        let _ = overflow.split_to(n);
        stack.tcp_output(pcb);
    }
}

/// Drive one flow until both directions finish or it dies
pub(crate) async fn run_flow(
    pcb: PcbId,
    stack: Arc<dyn NetStack>,
    mut remote_tx: RemoteTx,
    mut remote_rx: RemoteRx,
    mut events: mpsc::UnboundedReceiver<FlowEvent>,
    events_tx: mpsc::UnboundedSender<FlowEvent>,
    counters: Arc<TrafficCounters>,
) {
    let timer = ActivityTimer::new(CONNECTION_IDLE, move || {
        let _ = events_tx.send(FlowEvent::Timeout);
    });

    let mut overflow = BytesMut::new();
    let mut uplink_done = false;
    let mut downlink_done = false;

    loop {
        if uplink_done && downlink_done && overflow.is_empty() {
            stack.tcp_close(pcb);
            break;
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(FlowEvent::Recv(Some(data))) => {
                    let len = data.len();
                    timer.update();
                    match remote_tx.send(data).await {
                        Ok(()) => {
                            counters.add_uplink(len as u64);
                            // Window advances only after the remote accepted
                            // the bytes; nothing is dropped.
                            stack.tcp_recved(pcb, len);
                        }
                        Err(e) => {
                            if !e.is_silent() {
                                debug!("[pcb {}] uplink failed: {}", pcb, e);
                            }
                            stack.tcp_abort(pcb);
                            break;
                        }
                    }
                }
                Some(FlowEvent::Recv(None)) => {
                    uplink_done = true;
                    remote_tx.close().await;
                    timer.set_timeout(HALF_CLOSED_IDLE);
                }
                Some(FlowEvent::Sent(_len)) => {
                    timer.update();
                    drain_overflow(&*stack, pcb, &mut overflow);
                }
                Some(FlowEvent::Error) => {
                    // PCB already invalid; just drop the remote side
                    break;
                }
                Some(FlowEvent::Timeout) => {
                    debug!("[pcb {}] inactivity timeout", pcb);
                    stack.tcp_abort(pcb);
                    break;
                }
                None => break,
            },
            chunk = remote_rx.receive(), if !downlink_done && overflow.is_empty() => match chunk {
                Ok(Some(data)) => {
                    timer.update();
                    counters.add_downlink(data.len() as u64);
                    push_downlink(&*stack, pcb, &mut overflow, &data);
                }
                Ok(None) => {
                    downlink_done = true;
                    timer.set_timeout(HALF_CLOSED_IDLE);
                }
                Err(e) => {
                    if !e.is_silent() {
                        warn!("[pcb {}] downlink failed: {}", pcb, e);
                    }
                    stack.tcp_abort(pcb);
                    break;
                }
            }
        }
    }

    timer.cancel();
    remote_tx.close().await;
}
