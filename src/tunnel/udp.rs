//! UDP flow table
//!
//! Flows are keyed by the full 4-tuple. Each flow owns either a dedicated
//! VLESS-UDP pipeline or a mux sub-stream (XUDP attaches the flow's
//! GlobalID), and dies when the remote side closes, on error, or when the
//! sweeper finds it idle. Responses are synthesized through the stack with
//! source and destination swapped.

use super::stack::NetStack;
use super::tcp::{RemoteRx, RemoteTx};
use super::TrafficCounters;
use crate::common::Address;
use crate::outbound::Outbound;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A flow is reaped after this much inactivity
pub(crate) const UDP_IDLE: Duration = Duration::from_secs(60);

/// One UDP 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

struct FlowHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    last_activity: Arc<Mutex<Instant>>,
}

#[derive(Default)]
pub(crate) struct UdpFlows {
    flows: DashMap<FlowKey, FlowHandle>,
}

impl UdpFlows {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(UdpFlows::default())
    }

    pub(crate) fn len(&self) -> usize {
        self.flows.len()
    }

    /// Route one local datagram, creating the flow on first sight
    pub(crate) fn dispatch(
        table: &Arc<Self>,
        key: FlowKey,
        payload: Bytes,
        stack: &Arc<dyn NetStack>,
        outbound: &Arc<Outbound>,
        counters: &Arc<TrafficCounters>,
    ) {
        if let Some(handle) = table.flows.get(&key) {
            *handle.last_activity.lock() = Instant::now();
            let _ = handle.tx.send(payload);
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let _ = tx.send(payload);
        table.flows.insert(
            key,
            FlowHandle {
                tx,
                last_activity: last_activity.clone(),
            },
        );

        let table = table.clone();
        let stack = stack.clone();
        let outbound = outbound.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            run_udp_flow(key, stack, outbound, rx, last_activity, counters).await;
            table.flows.remove(&key);
        });
    }

    /// Drop flows idle past `idle`; their tasks end when the sender goes
    pub(crate) fn sweep(&self, idle: Duration) {
        self.flows
            .retain(|_, handle| handle.last_activity.lock().elapsed() < idle);
    }

    pub(crate) fn clear(&self) {
        self.flows.clear();
    }
}

async fn run_udp_flow(
    key: FlowKey,
    stack: Arc<dyn NetStack>,
    outbound: Arc<Outbound>,
    mut local_rx: mpsc::UnboundedReceiver<Bytes>,
    last_activity: Arc<Mutex<Instant>>,
    counters: Arc<TrafficCounters>,
) {
    let target = Address::Ip(key.dst);

    let remote = if outbound.uses_mux_for_udp() {
        outbound
            .open_mux_udp(target, (key.src.ip().to_string(), key.src.port()))
            .await
            .map(|session| {
                let (tx, rx) = session.split();
                (RemoteTx::Mux(tx), RemoteRx::Mux(rx))
            })
    } else {
        outbound.dial_udp(&target).await.map(|stream| {
            let (tx, rx) = stream.into_split();
            (RemoteTx::Stream(tx), RemoteRx::Stream(rx))
        })
    };

    let (mut remote_tx, mut remote_rx) = match remote {
        Ok(pair) => pair,
        Err(e) => {
            // Vision drops UDP/443 without a trace
            if !e.is_silent() {
                warn!("UDP flow {} -> {} dial failed: {}", key.src, key.dst, e);
            }
            return;
        }
    };
    debug!("UDP flow {} -> {} established", key.src, key.dst);

    loop {
        tokio::select! {
            datagram = local_rx.recv() => match datagram {
                Some(datagram) => {
                    *last_activity.lock() = Instant::now();
                    counters.add_uplink(datagram.len() as u64);
                    if remote_tx.send(datagram).await.is_err() {
                        break;
                    }
                }
                // Sender dropped: swept for idleness or tunnel shutdown
                None => break,
            },
            incoming = remote_rx.receive() => match incoming {
                Ok(Some(datagram)) => {
                    *last_activity.lock() = Instant::now();
                    counters.add_downlink(datagram.len() as u64);
                    // The response's source is the flow's original
                    // destination, and vice versa
                    stack.udp_sendto(key.dst, key.src, &datagram);
                }
                Ok(None) => break,
                Err(e) => {
                    if !e.is_silent() {
                        debug!("UDP flow {} -> {} read failed: {}", key.src, key.dst, e);
                    }
                    break;
                }
            }
        }
    }

    remote_tx.close().await;
    debug!("UDP flow {} -> {} closed", key.src, key.dst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_removes_idle_flows() {
        let flows = UdpFlows::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = FlowKey {
            src: "10.8.0.2:40000".parse().unwrap(),
            dst: "1.1.1.1:53".parse().unwrap(),
        };
        flows.flows.insert(
            key,
            FlowHandle {
                tx,
                last_activity: Arc::new(Mutex::new(
                    Instant::now() - Duration::from_secs(120),
                )),
            },
        );
        assert_eq!(flows.len(), 1);
        flows.sweep(UDP_IDLE);
        assert_eq!(flows.len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_flows() {
        let flows = UdpFlows::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = FlowKey {
            src: "10.8.0.2:40000".parse().unwrap(),
            dst: "1.1.1.1:53".parse().unwrap(),
        };
        flows.flows.insert(
            key,
            FlowHandle {
                tx,
                last_activity: Arc::new(Mutex::new(Instant::now())),
            },
        );
        flows.sweep(UDP_IDLE);
        assert_eq!(flows.len(), 1);
    }
}
