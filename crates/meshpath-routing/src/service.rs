//! Async shell around the routing state machine.
//!
//! One tokio task owns the protocol state, the PANN server/client sockets,
//! and every timer. External callers post commands through a
//! [`RoutingHandle`]; reads travel back over oneshot channels so all state
//! access stays serialized on the loop.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, trace, warn};

use meshpath_core::pann::PannFrame;
use meshpath_core::types::MacAddr;

use crate::constants::{
    HOUSEKEEPING_INTERVAL_MS, ROOT_PANN_INTERVAL_MS, SYNC_ROUTES_DEBOUNCE_MS, SYNC_ROUTES_RETRY_MS,
};
use crate::engine::{PannAction, RoutingConfig, RoutingState};
use crate::error::RoutingError;
use crate::fib::{FibClient, RouteInstaller};
use crate::gateway::GatewaySelection;
use crate::metric::StationStats;
use crate::path::MeshPath;

/// Size of the receive buffer; PANN frames are far smaller.
const RECV_BUFFER: usize = 2048;

/// Depth of the command queue feeding the loop.
const COMMAND_QUEUE: usize = 64;

/// Socket and timer configuration for the routing service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the PANN server socket binds to.
    pub bind_addr: SocketAddr,
    /// Address self-originated and forwarded PANNs are sent to (typically
    /// a broadcast or multicast group for the mesh segment).
    pub target_addr: SocketAddr,
    /// IP ToS applied to transmitted datagrams.
    pub tos: Option<u32>,
    pub housekeeping_interval_ms: u64,
    pub root_pann_interval_ms: u64,
    pub sync_debounce_ms: u64,
    pub sync_retry_ms: u64,
    /// Static source-IP to station mapping for segments where the MAC
    /// cannot be recovered from the source address itself.
    pub static_neighbors: HashMap<IpAddr, MacAddr>,
    pub routing: RoutingConfig,
}

impl ServiceConfig {
    pub fn new(bind_addr: SocketAddr, target_addr: SocketAddr, routing: RoutingConfig) -> Self {
        Self {
            bind_addr,
            target_addr,
            tos: None,
            housekeeping_interval_ms: HOUSEKEEPING_INTERVAL_MS,
            root_pann_interval_ms: ROOT_PANN_INTERVAL_MS,
            sync_debounce_ms: SYNC_ROUTES_DEBOUNCE_MS,
            sync_retry_ms: SYNC_ROUTES_RETRY_MS,
            static_neighbors: HashMap::new(),
            routing,
        }
    }
}

enum RoutingCommand {
    SetGatewayStatus(bool),
    UpdateStationStats(Vec<(MacAddr, StationStats)>),
    DumpPaths(oneshot::Sender<Vec<MeshPath>>),
    CurrentGateway(oneshot::Sender<Option<GatewaySelection>>),
    IsInTopKGates(MacAddr, oneshot::Sender<bool>),
    GetCounters(oneshot::Sender<HashMap<String, i64>>),
}

/// Cloneable handle for posting work into the routing loop.
#[derive(Clone)]
pub struct RoutingHandle {
    cmd_tx: mpsc::Sender<RoutingCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl RoutingHandle {
    pub async fn set_gateway_status(&self, is_gate: bool) -> Result<(), RoutingError> {
        self.cmd_tx
            .send(RoutingCommand::SetGatewayStatus(is_gate))
            .await
            .map_err(|_| RoutingError::ChannelClosed)
    }

    pub async fn update_station_stats(
        &self,
        stats: Vec<(MacAddr, StationStats)>,
    ) -> Result<(), RoutingError> {
        self.cmd_tx
            .send(RoutingCommand::UpdateStationStats(stats))
            .await
            .map_err(|_| RoutingError::ChannelClosed)
    }

    pub async fn dump_paths(&self) -> Result<Vec<MeshPath>, RoutingError> {
        self.request(RoutingCommand::DumpPaths).await
    }

    pub async fn current_gateway(&self) -> Result<Option<GatewaySelection>, RoutingError> {
        self.request(RoutingCommand::CurrentGateway).await
    }

    pub async fn is_station_in_top_k_gates(&self, mac: MacAddr) -> Result<bool, RoutingError> {
        self.request(|tx| RoutingCommand::IsInTopKGates(mac, tx))
            .await
    }

    pub async fn counters(&self) -> Result<HashMap<String, i64>, RoutingError> {
        self.request(RoutingCommand::GetCounters).await
    }

    /// Signal the loop to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoutingCommand,
    ) -> Result<T, RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RoutingError::ChannelClosed)?;
        rx.await.map_err(|_| RoutingError::ChannelClosed)
    }
}

/// The routing event loop plus the sockets it owns.
pub struct RoutingService<F: FibClient> {
    cfg: ServiceConfig,
    state: RoutingState,
    installer: RouteInstaller<F>,
    server: UdpSocket,
    client: UdpSocket,
    cmd_tx: mpsc::Sender<RoutingCommand>,
    cmd_rx: mpsc::Receiver<RoutingCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<F: FibClient> RoutingService<F> {
    /// Bind the PANN sockets and assemble the service.
    pub async fn bind(cfg: ServiceConfig, fib: F) -> Result<Self, RoutingError> {
        let server = UdpSocket::bind(cfg.bind_addr).await?;
        let client = make_client_socket(&cfg)?;

        info!(
            addr = %server.local_addr()?,
            station = %cfg.routing.local_addr,
            "mesh path service bound"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            state: RoutingState::new(cfg.routing.clone()),
            installer: RouteInstaller::new(fib),
            cfg,
            server,
            client,
            cmd_tx,
            cmd_rx,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    /// Address the server socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RoutingError> {
        Ok(self.server.local_addr()?)
    }

    /// A handle for posting commands and shutting the loop down.
    pub fn handle(&self) -> RoutingHandle {
        RoutingHandle {
            cmd_tx: self.cmd_tx.clone(),
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Run the event loop to completion (shutdown signal).
    pub async fn run(self) {
        let Self {
            cfg,
            mut state,
            mut installer,
            server,
            client,
            cmd_tx,
            mut cmd_rx,
            stop_tx: _stop_tx,
            mut stop_rx,
        } = self;
        // The loop holds its own sender so an idle command queue never
        // reads as closed; shutdown comes from the watch channel.
        let _cmd_tx = cmd_tx;

        let epoch = Instant::now();
        let now_ms = |epoch: Instant| -> u64 { epoch.elapsed().as_millis() as u64 };

        let mut housekeeping = interval(Duration::from_millis(cfg.housekeeping_interval_ms));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut root_emission = interval(Duration::from_millis(cfg.root_pann_interval_ms));
        root_emission.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut buf = vec![0u8; RECV_BUFFER];
        let mut sync_at: Option<Instant> = None;

        loop {
            let sync_deadline = sync_at;
            let sync_timer = async move {
                match sync_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = server.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            let actions = handle_datagram(
                                &mut state,
                                &cfg.static_neighbors,
                                src,
                                &buf[..len],
                                now_ms(epoch),
                            );
                            perform_actions(actions, &client, &cfg, &mut sync_at).await;
                        }
                        Err(e) => {
                            // UDP errors are typically transient; keep going.
                            warn!("pann recv error: {e}");
                        }
                    }
                }
                command = cmd_rx.recv() => {
                    let Some(command) = command else { break };
                    let actions = handle_command(&mut state, command, now_ms(epoch));
                    perform_actions(actions, &client, &cfg, &mut sync_at).await;
                }
                _ = housekeeping.tick() => {
                    let actions = state.housekeeping(now_ms(epoch));
                    perform_actions(actions, &client, &cfg, &mut sync_at).await;
                }
                _ = root_emission.tick() => {
                    let actions = state.root_tick();
                    perform_actions(actions, &client, &cfg, &mut sync_at).await;
                }
                _ = sync_timer => {
                    sync_at = None;
                    let desired = state.desired_routes(now_ms(epoch));
                    if let Err(e) = installer.sync(&desired).await {
                        warn!("route sync failed, will retry: {e}");
                        sync_at = Some(Instant::now() + Duration::from_millis(cfg.sync_retry_ms));
                    }
                }
                _ = stop_rx.changed() => {
                    break;
                }
            }
        }

        info!("mesh path service stopped");
    }
}

/// Decode and process one received datagram.
fn handle_datagram(
    state: &mut RoutingState,
    static_neighbors: &HashMap<IpAddr, MacAddr>,
    src: SocketAddr,
    data: &[u8],
    now_ms: u64,
) -> Vec<PannAction> {
    let Some(sa) = resolve_station(static_neighbors, &src) else {
        debug!(%src, "dropping datagram from unmapped source");
        return Vec::new();
    };

    match PannFrame::decode(data) {
        Ok(frame) => state.handle_pann_frame(sa, &frame, now_ms),
        Err(e) => {
            state.note_malformed_frame();
            debug!(%src, "dropping malformed pann: {e}");
            Vec::new()
        }
    }
}

fn handle_command(
    state: &mut RoutingState,
    command: RoutingCommand,
    now_ms: u64,
) -> Vec<PannAction> {
    match command {
        RoutingCommand::SetGatewayStatus(is_gate) => state.set_gateway_status(is_gate, now_ms),
        RoutingCommand::UpdateStationStats(stats) => {
            state.handle_station_stats(&stats);
            Vec::new()
        }
        RoutingCommand::DumpPaths(reply) => {
            let _ = reply.send(state.dump_paths());
            Vec::new()
        }
        RoutingCommand::CurrentGateway(reply) => {
            let _ = reply.send(state.current_gateway());
            Vec::new()
        }
        RoutingCommand::IsInTopKGates(mac, reply) => {
            let _ = reply.send(state.is_station_in_top_k_gates(mac, now_ms));
            Vec::new()
        }
        RoutingCommand::GetCounters(reply) => {
            let _ = reply.send(state.counters().snapshot());
            Vec::new()
        }
    }
}

/// Execute the actions a state transition produced.
async fn perform_actions(
    actions: Vec<PannAction>,
    client: &UdpSocket,
    cfg: &ServiceConfig,
    sync_at: &mut Option<Instant>,
) {
    for action in actions {
        match action {
            PannAction::Transmit { da, frame } => {
                let bytes = frame.encode();
                trace!(%da, len = bytes.len(), "transmitting pann");
                if let Err(e) = client.send_to(&bytes, cfg.target_addr).await {
                    warn!("pann transmit failed: {e}");
                }
            }
            PannAction::ScheduleRouteSync => {
                // Debounce: keep the earliest pending deadline.
                sync_at.get_or_insert_with(|| {
                    Instant::now() + Duration::from_millis(cfg.sync_debounce_ms)
                });
            }
        }
    }
}

/// Map a datagram source to the transmitting station.
///
/// The static table wins; otherwise the MAC is recovered from an EUI-64
/// link-local IPv6 source the way 802.11s stacks form them.
fn resolve_station(
    static_neighbors: &HashMap<IpAddr, MacAddr>,
    src: &SocketAddr,
) -> Option<MacAddr> {
    if let Some(mac) = static_neighbors.get(&src.ip()) {
        return Some(*mac);
    }
    match src.ip() {
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let link_local = o[0] == 0xfe && (o[1] & 0xc0) == 0x80;
            let eui64 = o[11] == 0xff && o[12] == 0xfe;
            if link_local && eui64 {
                Some(MacAddr::new([
                    o[8] ^ 0x02,
                    o[9],
                    o[10],
                    o[13],
                    o[14],
                    o[15],
                ]))
            } else {
                None
            }
        }
        IpAddr::V4(_) => None,
    }
}

/// Build the transmit socket, applying ToS before conversion.
fn make_client_socket(cfg: &ServiceConfig) -> Result<UdpSocket, RoutingError> {
    let domain = Domain::for_address(cfg.target_addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_broadcast(true)?;

    if let Some(tos) = cfg.tos {
        if cfg.target_addr.is_ipv4() {
            socket.set_tos(tos)?;
        } else {
            debug!("ToS not applied to IPv6 transmit socket");
        }
    }

    // Source the datagrams from the same address we serve on, so peers can
    // attribute them to this station.
    let bind: SocketAddr = (cfg.bind_addr.ip(), 0).into();
    socket.bind(&bind.into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn resolve_station_prefers_static_table() {
        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        let ip: IpAddr = Ipv4Addr::new(127, 0, 0, 2).into();
        let table = HashMap::from([(ip, mac)]);

        let src: SocketAddr = (ip, 4000).into();
        assert_eq!(resolve_station(&table, &src), Some(mac));
    }

    #[test]
    fn resolve_station_recovers_mac_from_eui64() {
        // fe80::021a:ffff:fe00:0bc3 carries MAC 00:1a:ff:00:0b:c3.
        let v6 = Ipv6Addr::new(0xfe80, 0, 0, 0, 0x021a, 0xffff, 0xfe00, 0x0bc3);
        let src: SocketAddr = (v6, 4000).into();

        let got = resolve_station(&HashMap::new(), &src).unwrap();
        assert_eq!(got, MacAddr::new([0x00, 0x1a, 0xff, 0x00, 0x0b, 0xc3]));
    }

    #[test]
    fn resolve_station_rejects_non_link_local() {
        let v6 = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0x021a, 0xffff, 0xfe00, 0x0bc3);
        let src: SocketAddr = (v6, 4000).into();
        assert_eq!(resolve_station(&HashMap::new(), &src), None);

        let v4: SocketAddr = (Ipv4Addr::LOCALHOST, 4000).into();
        assert_eq!(resolve_station(&HashMap::new(), &v4), None);
    }

    #[test]
    fn resolve_station_rejects_non_eui64_link_local() {
        let v6 = Ipv6Addr::new(0xfe80, 0, 0, 0, 1, 2, 3, 4);
        let src: SocketAddr = (v6, 4000).into();
        assert_eq!(resolve_station(&HashMap::new(), &src), None);
    }
}
