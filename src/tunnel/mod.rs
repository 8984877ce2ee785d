//! Tunnel core - bridges the user-space IP stack to the outbound pipeline
//!
//! The host feeds IP packets into its stack; the stack's catch-all
//! listeners surface flows as [`StackEvent`]s which the tunnel routes to
//! per-flow tasks. The host is expected to exclude the proxy server's
//! resolved address from tunnel routes so the outer connection does not
//! loop back through the device.

pub mod stack;
pub mod tcp;
pub mod timer;
pub mod udp;

pub use stack::{NetStack, PcbId, StackEvent};

use crate::config::Config;
use crate::dns::Resolver;
use crate::outbound::Outbound;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcp::{FlowEvent, RemoteRx, RemoteTx};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use udp::{FlowKey, UdpFlows};

/// Tunnel device MTU
pub const TUN_MTU: u16 = 1400;

/// Local tunnel addresses
pub const LOCAL_IPV4: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
pub const LOCAL_IPV4_PREFIX: u8 = 24;
pub const LOCAL_IPV6: Ipv6Addr = Ipv6Addr::new(0xFD00, 0, 0, 0, 0, 0, 0, 2);
pub const LOCAL_IPV6_PREFIX: u8 = 64;

/// DNS servers pushed to the device
pub const DNS_SERVERS_V4: [Ipv4Addr; 2] = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(1, 0, 0, 1)];
pub const DNS_SERVERS_V6: [Ipv6Addr; 2] = [
    Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111),
    Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1001),
];

/// Stack timer processing cadence
const STACK_TIMER_PERIOD: Duration = Duration::from_millis(250);

/// UDP flow sweeper cadence
const UDP_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Cumulative per-direction byte counters
#[derive(Default)]
pub struct TrafficCounters {
    uplink: AtomicU64,
    downlink: AtomicU64,
}

impl TrafficCounters {
    pub fn add_uplink(&self, n: u64) {
        self.uplink.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_downlink(&self, n: u64) {
        self.downlink.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uplink(&self) -> u64 {
        self.uplink.load(Ordering::Relaxed)
    }

    pub fn downlink(&self) -> u64 {
        self.downlink.load(Ordering::Relaxed)
    }
}

/// Tunnel core - owns the flow tables and the outbound dialer
pub struct Tunnel {
    stack: Arc<dyn NetStack>,
    outbound: Arc<Outbound>,
    tcp_flows: Mutex<HashMap<PcbId, mpsc::UnboundedSender<FlowEvent>>>,
    udp_flows: Arc<UdpFlows>,
    counters: Arc<TrafficCounters>,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Handle for spawning flow tasks that refer back to the tunnel
    weak: std::sync::Weak<Tunnel>,
}

impl Tunnel {
    /// Build a tunnel for one outbound endpoint
    pub fn new(config: Config, stack: Arc<dyn NetStack>) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            "Tunnel for {} ({}:{})",
            if config.name.is_empty() { "endpoint" } else { &config.name },
            config.server,
            config.port
        );

        let resolver = Arc::new(Resolver::new());
        let outbound = Arc::new(Outbound::new(Arc::new(config), resolver));

        let tunnel = Arc::new_cyclic(|weak| Tunnel {
            stack,
            outbound,
            tcp_flows: Mutex::new(HashMap::new()),
            udp_flows: UdpFlows::new(),
            counters: Arc::new(TrafficCounters::default()),
            background: Mutex::new(Vec::new()),
            weak: weak.clone(),
        });

        // Stack timer processing
        let stack = tunnel.stack.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STACK_TIMER_PERIOD);
            loop {
                interval.tick().await;
                stack.check_timeouts();
            }
        });

        // UDP idle sweeper
        let udp_flows = tunnel.udp_flows.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(UDP_SWEEP_PERIOD);
            loop {
                interval.tick().await;
                udp_flows.sweep(udp::UDP_IDLE);
            }
        });

        tunnel.background.lock().extend([ticker, sweeper]);
        Ok(tunnel)
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    pub fn traffic(&self) -> (u64, u64) {
        (self.counters.uplink(), self.counters.downlink())
    }

    pub fn tcp_flow_count(&self) -> usize {
        self.tcp_flows.lock().len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp_flows.len()
    }

    /// Route one stack event. Events for unknown flows are no-ops.
    pub fn handle_event(&self, event: StackEvent) {
        match event {
            StackEvent::TcpAccept { pcb, src, dst } => {
                let tunnel = match self.weak.upgrade() {
                    Some(tunnel) => tunnel,
                    None => return,
                };
                debug!("TCP accept {} -> {} (pcb {})", src, dst, pcb);
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.tcp_flows.lock().insert(pcb, events_tx.clone());
                tokio::spawn(async move {
                    tunnel.drive_tcp_flow(pcb, dst, events_rx, events_tx).await;
                    tunnel.tcp_flows.lock().remove(&pcb);
                });
            }
            StackEvent::TcpRecv { pcb, data } => {
                if let Some(sender) = self.tcp_flows.lock().get(&pcb) {
                    let _ = sender.send(FlowEvent::Recv(data));
                }
            }
            StackEvent::TcpSent { pcb, len } => {
                if let Some(sender) = self.tcp_flows.lock().get(&pcb) {
                    let _ = sender.send(FlowEvent::Sent(len));
                }
            }
            StackEvent::TcpError { pcb } => {
                if let Some(sender) = self.tcp_flows.lock().remove(&pcb) {
                    let _ = sender.send(FlowEvent::Error);
                }
            }
            StackEvent::UdpRecv { src, dst, payload } => {
                UdpFlows::dispatch(
                    &self.udp_flows,
                    FlowKey { src, dst },
                    payload,
                    &self.stack,
                    &self.outbound,
                    &self.counters,
                );
            }
        }
    }

    async fn drive_tcp_flow(
        &self,
        pcb: PcbId,
        dst: std::net::SocketAddr,
        events_rx: mpsc::UnboundedReceiver<FlowEvent>,
        events_tx: mpsc::UnboundedSender<FlowEvent>,
    ) {
        let target = crate::common::Address::Ip(dst);

        // Local bytes queue on the event channel while the pipeline dials
        let remote = if self.outbound.uses_mux_for_tcp() {
            self.outbound.open_mux_tcp(target).await.map(|session| {
                let (tx, rx) = session.split();
                (RemoteTx::Mux(tx), RemoteRx::Mux(rx))
            })
        } else {
            self.outbound.dial_tcp(&target, None).await.map(|stream| {
                let (tx, rx) = stream.into_split();
                (RemoteTx::Stream(tx), RemoteRx::Stream(rx))
            })
        };

        match remote {
            Ok((remote_tx, remote_rx)) => {
                tcp::run_flow(
                    pcb,
                    self.stack.clone(),
                    remote_tx,
                    remote_rx,
                    events_rx,
                    events_tx,
                    self.counters.clone(),
                )
                .await;
            }
            Err(e) => {
                if !e.is_silent() {
                    warn!("TCP flow to {} dial failed: {}", dst, e);
                }
                self.stack.tcp_abort(pcb);
            }
        }
    }

    /// Abort every active flow and stop the background tasks. The stack
    /// implementation removes TIME_WAIT PCBs without callbacks.
    pub fn shutdown(&self) {
        let mut flows = self.tcp_flows.lock();
        for (pcb, sender) in flows.drain() {
            self.stack.tcp_abort(pcb);
            let _ = sender.send(FlowEvent::Error);
        }
        drop(flows);

        self.udp_flows.clear();

        for task in self.background.lock().drain(..) {
            task.abort();
        }
        info!("Tunnel stopped");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
    }
}
