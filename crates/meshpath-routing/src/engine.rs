//! PANN engine: the mesh path protocol state machine.
//!
//! [`RoutingState`] is pure and synchronous; every entry point takes the
//! current monotonic time and returns the I/O actions to execute. The async
//! shell in [`crate::service`] owns the sockets and timers and performs the
//! actions, so the whole protocol is testable without I/O.

use std::collections::HashMap;

use meshpath_core::pann::PannFrame;
use meshpath_core::stats::Counters;
use meshpath_core::types::MacAddr;

use crate::constants::{
    ACTIVE_PATH_TIMEOUT_MS, DEFAULT_ELEMENT_TTL, GATEWAY_CHANGE_THRESHOLD_FACTOR, MAX_HOP_COUNT,
    METRIC_INFINITY, NEIGHBOR_STATS_TTL_MS, TOP_GATE_COUNT,
};
use crate::gateway::{self, GatewaySelection};
use crate::metric::{StationStats, airtime_link_metric};
use crate::path::{MeshPath, PathTable};

pub const COUNTER_PANN_RECEIVED: &str = "mesh_path.pann_received";
pub const COUNTER_PANN_SENT: &str = "mesh_path.pann_sent";
pub const COUNTER_PANN_MALFORMED: &str = "mesh_path.pann_malformed";
pub const COUNTER_PANN_DROPPED: &str = "mesh_path.pann_dropped";

/// Protocol parameters for one mesh station.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// This station's own address.
    pub local_addr: MacAddr,
    /// TTL placed on self-originated PANN elements.
    pub element_ttl: u8,
    /// Expiry applied to learned paths.
    pub active_path_timeout_ms: u64,
    /// Gateway switch hysteresis factor.
    pub gateway_change_threshold_factor: f64,
    /// K for `is_station_in_top_k_gates`.
    pub top_gate_count: usize,
    /// Neighbor links not refreshed within this window stop being usable.
    pub neighbor_stats_ttl_ms: u64,
    /// Whether this station emits proactive announcements as a root.
    pub is_root: bool,
    /// Whether this station starts out as a mesh gate.
    pub is_gate: bool,
}

impl RoutingConfig {
    pub fn new(local_addr: MacAddr) -> Self {
        Self {
            local_addr,
            element_ttl: DEFAULT_ELEMENT_TTL,
            active_path_timeout_ms: ACTIVE_PATH_TIMEOUT_MS,
            gateway_change_threshold_factor: GATEWAY_CHANGE_THRESHOLD_FACTOR,
            top_gate_count: TOP_GATE_COUNT,
            neighbor_stats_ttl_ms: NEIGHBOR_STATS_TTL_MS,
            is_root: false,
            is_gate: false,
        }
    }
}

/// An I/O action requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PannAction {
    /// Transmit a frame toward the given layer-2 destination.
    Transmit { da: MacAddr, frame: PannFrame },
    /// Kernel routes no longer match the table; schedule a debounced sync.
    ScheduleRouteSync,
}

/// Link quality toward one direct neighbor.
#[derive(Debug, Clone, Copy)]
struct NeighborLink {
    metric: u32,
    last_seen_ms: u64,
}

/// The mesh path protocol state machine.
pub struct RoutingState {
    cfg: RoutingConfig,
    /// Local sequence number; incremented for each self-originated PANN.
    sn: u64,
    is_gate: bool,
    paths: PathTable,
    current_gate: Option<GatewaySelection>,
    neighbors: HashMap<MacAddr, NeighborLink>,
    counters: Counters,
}

impl RoutingState {
    pub fn new(cfg: RoutingConfig) -> Self {
        let is_gate = cfg.is_gate;
        Self {
            cfg,
            sn: 0,
            is_gate,
            paths: PathTable::new(),
            current_gate: None,
            neighbors: HashMap::new(),
            counters: Counters::new(),
        }
    }

    /// Process a PANN delivered by neighbor `sa`.
    pub fn handle_pann_frame(
        &mut self,
        sa: MacAddr,
        frame: &PannFrame,
        now_ms: u64,
    ) -> Vec<PannAction> {
        self.counters.bump(COUNTER_PANN_RECEIVED);

        // Our own announcement came back around the mesh.
        if frame.orig_addr == self.cfg.local_addr {
            return Vec::new();
        }

        let link_metric = self.link_metric(sa);
        let new_metric = if link_metric == METRIC_INFINITY {
            None
        } else {
            frame.metric.checked_add(link_metric)
        };
        let Some(new_metric) = new_metric else {
            self.counters.bump(COUNTER_PANN_DROPPED);
            return Vec::new();
        };

        let timeout = self.cfg.active_path_timeout_ms;
        let path = self.paths.get_or_create(frame.orig_addr, now_ms);
        let sn_advanced = frame.orig_sn > path.sn;
        let accepted = sn_advanced || (frame.orig_sn == path.sn && new_metric < path.metric);
        if !accepted {
            self.counters.bump(COUNTER_PANN_DROPPED);
            return Vec::new();
        }

        let next_hop_changed = path.next_hop != sa;
        path.next_hop = sa;
        path.sn = frame.orig_sn;
        path.metric = new_metric;
        path.hop_count = frame.hop_count.saturating_add(1);
        path.exp_time_ms = now_ms + timeout;
        path.is_gate = frame.is_gate;
        path.is_root = true;

        tracing::debug!(
            orig = %frame.orig_addr,
            via = %sa,
            sn = frame.orig_sn,
            metric = new_metric,
            gate = frame.is_gate,
            "mesh path updated"
        );

        let mut actions = Vec::new();

        // Forward with decremented TTL and accumulated metric. Equal-sn
        // metric improvements update the local path but are not re-flooded;
        // only strictly newer sequence numbers propagate.
        if sn_advanced
            && frame.ttl > 1
            && u16::from(frame.hop_count) + 1 < u16::from(MAX_HOP_COUNT)
        {
            self.counters.bump(COUNTER_PANN_SENT);
            actions.push(PannAction::Transmit {
                da: MacAddr::BROADCAST,
                frame: PannFrame {
                    hop_count: frame.hop_count + 1,
                    ttl: frame.ttl - 1,
                    metric: new_metric,
                    ..*frame
                },
            });
        }

        if self.update_gateway_selection(now_ms) || next_hop_changed {
            actions.push(PannAction::ScheduleRouteSync);
        }

        actions
    }

    /// Record that a received datagram failed to decode.
    pub fn note_malformed_frame(&mut self) {
        self.counters.bump(COUNTER_PANN_MALFORMED);
    }

    /// Housekeeping tick: reap expired paths and stale neighbor links,
    /// then re-evaluate the gateway selection.
    pub fn housekeeping(&mut self, now_ms: u64) -> Vec<PannAction> {
        let ttl = self.cfg.neighbor_stats_ttl_ms;
        self.neighbors
            .retain(|_, link| now_ms.saturating_sub(link.last_seen_ms) <= ttl);

        // Expired paths stay while they back the installed gateway; the
        // selection update below clears the gate first, so they fall out on
        // the following tick.
        let gate_mac = self.current_gate.map(|g| g.mac);
        self.paths
            .retain(|dst, path| !path.expired(now_ms) || Some(*dst) == gate_mac);

        if self.update_gateway_selection(now_ms) {
            vec![PannAction::ScheduleRouteSync]
        } else {
            Vec::new()
        }
    }

    /// Root emission tick: announce ourselves while root or gate.
    pub fn root_tick(&mut self) -> Vec<PannAction> {
        if !(self.cfg.is_root || self.is_gate) {
            return Vec::new();
        }
        vec![self.emit_self_pann()]
    }

    /// Change this station's gate status.
    ///
    /// Dropping out of gate service emits a one-shot withdrawal PANN with
    /// `is_gate = false` so peers stop steering default traffic here.
    pub fn set_gateway_status(&mut self, is_gate: bool, now_ms: u64) -> Vec<PannAction> {
        let was_gate = self.is_gate;
        self.is_gate = is_gate;

        let mut actions = Vec::new();
        if was_gate && !is_gate {
            tracing::info!("no longer a mesh gate, withdrawing advertisement");
            actions.push(self.emit_self_pann());
        }
        if self.update_gateway_selection(now_ms) {
            actions.push(PannAction::ScheduleRouteSync);
        }
        actions
    }

    /// Ingest fresh neighbor statistics from the pinger collaborator.
    pub fn handle_station_stats(&mut self, stats: &[(MacAddr, StationStats)]) {
        for (peer, st) in stats {
            self.update_neighbor(*peer, airtime_link_metric(st), st.last_seen_ms);
        }
    }

    /// Record a neighbor link metric directly.
    pub fn update_neighbor(&mut self, peer: MacAddr, metric: u32, last_seen_ms: u64) {
        self.neighbors.insert(
            peer,
            NeighborLink {
                metric,
                last_seen_ms,
            },
        );
    }

    /// Whether `mac` ranks among the configured number of best gates.
    #[must_use]
    pub fn is_station_in_top_k_gates(&self, mac: MacAddr, now_ms: u64) -> bool {
        gateway::is_in_top_k_gates(
            &self.gate_candidates(now_ms),
            mac,
            self.cfg.top_gate_count,
        )
    }

    /// The routes the kernel should hold right now.
    #[must_use]
    pub fn desired_routes(&self, now_ms: u64) -> crate::fib::RouteSet {
        let mut routes = crate::fib::RouteSet::default();
        for (dst, path) in self.paths.iter() {
            if path.is_learned() && !path.expired(now_ms) {
                routes.next_hops.insert(*dst, path.next_hop);
            }
        }
        routes.default_via = self
            .current_gate
            .and_then(|gate| self.paths.get(&gate.mac))
            .filter(|path| path.is_learned())
            .map(|path| path.next_hop);
        routes
    }

    /// Snapshot of all mesh paths.
    #[must_use]
    pub fn dump_paths(&self) -> Vec<MeshPath> {
        self.paths.dump()
    }

    #[must_use]
    pub fn current_gateway(&self) -> Option<GatewaySelection> {
        self.current_gate
    }

    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub fn is_gate(&self) -> bool {
        self.is_gate
    }

    fn emit_self_pann(&mut self) -> PannAction {
        self.sn += 1;
        self.counters.bump(COUNTER_PANN_SENT);
        PannAction::Transmit {
            da: MacAddr::BROADCAST,
            frame: PannFrame {
                orig_addr: self.cfg.local_addr,
                orig_sn: self.sn,
                hop_count: 0,
                ttl: self.cfg.element_ttl,
                target_addr: MacAddr::BROADCAST,
                metric: 0,
                is_gate: self.is_gate,
                reply_requested: false,
            },
        }
    }

    fn link_metric(&self, sa: MacAddr) -> u32 {
        self.neighbors
            .get(&sa)
            .map(|link| link.metric)
            .unwrap_or(METRIC_INFINITY)
    }

    fn gate_candidates(&self, now_ms: u64) -> Vec<(MacAddr, u32)> {
        self.paths
            .iter()
            .filter(|(_, p)| p.is_gate && p.is_learned() && !p.expired(now_ms))
            .map(|(dst, p)| (*dst, p.metric))
            .collect()
    }

    /// Re-run gateway selection; returns whether the selection changed.
    fn update_gateway_selection(&mut self, now_ms: u64) -> bool {
        // A station that is itself a gate installs no default route via
        // the mesh.
        let candidates = if self.is_gate {
            Vec::new()
        } else {
            self.gate_candidates(now_ms)
        };

        let next = gateway::select_gateway(
            &candidates,
            self.current_gate,
            self.cfg.gateway_change_threshold_factor,
        );
        if next == self.current_gate {
            return false;
        }

        match (self.current_gate, next) {
            (Some(old), Some(new)) if old.mac == new.mac => {
                tracing::debug!(gate = %new.mac, metric = new.metric, "gateway metric updated");
            }
            (_, Some(new)) => {
                tracing::info!(gate = %new.mac, metric = new.metric, "gateway changed");
            }
            (Some(old), None) => {
                tracing::info!(old = %old.mac, "gateway cleared");
            }
            (None, None) => {}
        }
        self.current_gate = next;
        true
    }
}
