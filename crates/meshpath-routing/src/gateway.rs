//! Gateway selection with change hysteresis.

use meshpath_core::types::MacAddr;

/// The currently selected default-route gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct GatewaySelection {
    /// Gate station the default route points toward.
    pub mac: MacAddr,
    /// Path metric to that gate at selection time.
    pub metric: u32,
}

/// Rank gate candidates by metric ascending, ties broken by address bytes.
#[must_use]
pub fn rank_gates(candidates: &[(MacAddr, u32)]) -> Vec<(MacAddr, u32)> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    ranked
}

/// Choose the gateway selection given the eligible candidates.
///
/// A challenger only displaces the current gate when the current metric is
/// at least `threshold_factor` times the challenger's; this hysteresis
/// keeps comparable gateways from flapping. A current gate that dropped out
/// of the candidate set is displaced unconditionally, and a current gate
/// that is still the best simply has its metric refreshed.
#[must_use]
pub fn select_gateway(
    candidates: &[(MacAddr, u32)],
    current: Option<GatewaySelection>,
    threshold_factor: f64,
) -> Option<GatewaySelection> {
    let ranked = rank_gates(candidates);
    let (best_mac, best_metric) = *ranked.first()?;
    let best = GatewaySelection {
        mac: best_mac,
        metric: best_metric,
    };

    let Some(cur) = current else {
        return Some(best);
    };
    if cur.mac == best.mac {
        return Some(best);
    }

    match ranked.iter().find(|(mac, _)| *mac == cur.mac) {
        // Current gate no longer advertises; take the best remaining.
        None => Some(best),
        Some((_, cur_metric)) => {
            if f64::from(*cur_metric) >= threshold_factor * f64::from(best.metric) {
                Some(best)
            } else {
                Some(GatewaySelection {
                    mac: cur.mac,
                    metric: *cur_metric,
                })
            }
        }
    }
}

/// Whether `mac` ranks among the `k` best gate candidates.
#[must_use]
pub fn is_in_top_k_gates(candidates: &[(MacAddr, u32)], mac: MacAddr, k: usize) -> bool {
    rank_gates(candidates)
        .iter()
        .take(k)
        .any(|(candidate, _)| *candidate == mac)
}
