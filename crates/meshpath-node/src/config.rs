//! TOML-based configuration for meshpath nodes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use meshpath_core::types::MacAddr;
use meshpath_prefix::manager::{DEFAULT_PREFIX_DB_MARKER, PrefixManagerConfig};
use meshpath_routing::constants::{
    ACTIVE_PATH_TIMEOUT_MS, DEFAULT_ELEMENT_TTL, GATEWAY_CHANGE_THRESHOLD_FACTOR,
    HOUSEKEEPING_INTERVAL_MS, ROOT_PANN_INTERVAL_MS, TOP_GATE_COUNT,
};
use meshpath_routing::engine::RoutingConfig;
use meshpath_routing::service::ServiceConfig;

use crate::error::NodeError;

/// Top-level node configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub prefix: PrefixSection,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }

    /// Build the routing service configuration.
    pub fn routing_service_config(&self) -> Result<ServiceConfig, NodeError> {
        let r = &self.routing;
        if r.mac.is_empty() {
            return Err(NodeError::Config("routing.mac is required".to_string()));
        }
        let local_addr: MacAddr = r
            .mac
            .parse()
            .map_err(|_| NodeError::Config(format!("invalid routing.mac '{}'", r.mac)))?;

        let mut routing = RoutingConfig::new(local_addr);
        routing.element_ttl = r.element_ttl;
        routing.active_path_timeout_ms = r.active_path_timeout_ms;
        routing.gateway_change_threshold_factor = r.gateway_change_threshold_factor;
        routing.top_gate_count = r.top_gate_count;
        routing.is_root = r.is_root;
        routing.is_gate = r.is_gate;

        let mut cfg = ServiceConfig::new(
            parse_socket_addr(&r.bind)?,
            parse_socket_addr(&r.target)?,
            routing,
        );
        cfg.tos = r.tos;
        cfg.housekeeping_interval_ms = r.housekeeping_interval_ms;
        cfg.root_pann_interval_ms = r.root_pann_interval_ms;

        let mut neighbors = HashMap::new();
        for entry in &r.neighbors {
            let ip: IpAddr = entry
                .addr
                .parse()
                .map_err(|_| NodeError::Config(format!("invalid neighbor addr '{}'", entry.addr)))?;
            let mac: MacAddr = entry
                .mac
                .parse()
                .map_err(|_| NodeError::Config(format!("invalid neighbor mac '{}'", entry.mac)))?;
            neighbors.insert(ip, mac);
        }
        cfg.static_neighbors = neighbors;

        Ok(cfg)
    }

    /// Build the prefix manager configuration.
    pub fn prefix_manager_config(&self) -> Result<PrefixManagerConfig, NodeError> {
        if self.node.node_id.is_empty() {
            return Err(NodeError::Config("node.node_id is required".to_string()));
        }
        let p = &self.prefix;
        let mut cfg = PrefixManagerConfig::new(self.node.node_id.clone());
        cfg.prefix_db_marker = p.prefix_db_marker.clone();
        cfg.enable_perf_measurement = p.enable_perf_measurement;
        cfg.hold_time_ms = p.hold_time_ms;
        Ok(cfg)
    }
}

/// The `[node]` section.
#[derive(Debug, Default, Deserialize)]
pub struct NodeSection {
    /// Node identifier used for the published prefix database key.
    #[serde(default)]
    pub node_id: String,
    /// Base directory for durable state. Defaults to `~/.meshpath/store`.
    pub data_dir: Option<String>,
}

/// The `[logging]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// The `[routing]` section.
#[derive(Debug, Deserialize)]
pub struct RoutingSection {
    /// This station's MAC address.
    #[serde(default)]
    pub mac: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_target")]
    pub target: String,
    /// IP ToS for transmitted PANN datagrams.
    pub tos: Option<u32>,
    #[serde(default = "default_element_ttl")]
    pub element_ttl: u8,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub is_gate: bool,
    #[serde(default = "default_active_path_timeout_ms")]
    pub active_path_timeout_ms: u64,
    #[serde(default = "default_root_pann_interval_ms")]
    pub root_pann_interval_ms: u64,
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    #[serde(default = "default_gateway_change_threshold_factor")]
    pub gateway_change_threshold_factor: f64,
    #[serde(default = "default_top_gate_count")]
    pub top_gate_count: usize,
    /// Static source-address to station mappings.
    #[serde(default)]
    pub neighbors: Vec<NeighborEntry>,
}

/// A `[[routing.neighbors]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NeighborEntry {
    pub addr: String,
    pub mac: String,
}

fn default_bind() -> String {
    "0.0.0.0:6668".to_string()
}

fn default_target() -> String {
    "255.255.255.255:6668".to_string()
}

fn default_element_ttl() -> u8 {
    DEFAULT_ELEMENT_TTL
}

fn default_active_path_timeout_ms() -> u64 {
    ACTIVE_PATH_TIMEOUT_MS
}

fn default_root_pann_interval_ms() -> u64 {
    ROOT_PANN_INTERVAL_MS
}

fn default_housekeeping_interval_ms() -> u64 {
    HOUSEKEEPING_INTERVAL_MS
}

fn default_gateway_change_threshold_factor() -> f64 {
    GATEWAY_CHANGE_THRESHOLD_FACTOR
}

fn default_top_gate_count() -> usize {
    TOP_GATE_COUNT
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            mac: String::new(),
            bind: default_bind(),
            target: default_target(),
            tos: None,
            element_ttl: default_element_ttl(),
            is_root: false,
            is_gate: false,
            active_path_timeout_ms: default_active_path_timeout_ms(),
            root_pann_interval_ms: default_root_pann_interval_ms(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            gateway_change_threshold_factor: default_gateway_change_threshold_factor(),
            top_gate_count: default_top_gate_count(),
            neighbors: Vec::new(),
        }
    }
}

/// The `[prefix]` section.
#[derive(Debug, Deserialize)]
pub struct PrefixSection {
    #[serde(default = "default_prefix_db_marker")]
    pub prefix_db_marker: String,
    #[serde(default)]
    pub enable_perf_measurement: bool,
    /// Startup grace period before advertisements leave the node.
    #[serde(default)]
    pub hold_time_ms: u64,
}

fn default_prefix_db_marker() -> String {
    DEFAULT_PREFIX_DB_MARKER.to_string()
}

impl Default for PrefixSection {
    fn default() -> Self {
        Self {
            prefix_db_marker: default_prefix_db_marker(),
            enable_perf_measurement: false,
            hold_time_ms: 0,
        }
    }
}

/// Parse a socket address string like "0.0.0.0:6668".
pub fn parse_socket_addr(s: &str) -> Result<SocketAddr, NodeError> {
    s.parse()
        .map_err(|e| NodeError::Config(format!("invalid socket address '{s}': {e}")))
}
