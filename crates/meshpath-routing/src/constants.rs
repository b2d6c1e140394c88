//! Protocol parameters and defaults.

/// How long a learned path stays usable without a refreshing PANN (ms).
pub const ACTIVE_PATH_TIMEOUT_MS: u64 = 30_000;

/// Period of the housekeeping scan (ms).
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

/// Period of self-originated PANN emission for roots and gates (ms).
pub const ROOT_PANN_INTERVAL_MS: u64 = 5_000;

/// Debounce applied between a route-affecting change and the FIB sync (ms).
pub const SYNC_ROUTES_DEBOUNCE_MS: u64 = 100;

/// Delay before retrying a failed FIB sync (ms).
pub const SYNC_ROUTES_RETRY_MS: u64 = 1_000;

/// Neighbor link metrics older than this stop being usable (ms).
pub const NEIGHBOR_STATS_TTL_MS: u64 = 60_000;

/// TTL placed on self-originated PANN elements.
pub const DEFAULT_ELEMENT_TTL: u8 = 32;

/// Hop count at which forwarding terminates.
pub const MAX_HOP_COUNT: u8 = 255;

/// A challenger gateway must be better than the current one by this factor.
pub const GATEWAY_CHANGE_THRESHOLD_FACTOR: f64 = 2.0;

/// How many best gates `is_station_in_top_k_gates` considers.
pub const TOP_GATE_COUNT: usize = 1;

/// Link metric for neighbors with no usable statistics; never wins selection.
pub const METRIC_INFINITY: u32 = u32::MAX;
