//! Airtime link metric derived from neighbor station statistics.
//!
//! Implements the standard 802.11s airtime formula. The protocol only
//! requires the metric to be additive, lower-is-better, and infinite for
//! neighbors without usable statistics.

use crate::constants::METRIC_INFINITY;

/// Fixed-point shift used throughout the airtime computation.
const ARITH_SHIFT: u32 = 8;

/// Reference frame length in bits.
const TEST_FRAME_LEN: u64 = 8192;

/// Per-frame channel access overhead, ~1 expressed in fixed point.
const DEVICE_CONSTANT: u64 = 1 << ARITH_SHIFT;

/// Fixed-point unit.
const S_UNIT: u64 = 1 << ARITH_SHIFT;

/// Links failing more than this percentage of frames are unusable.
const FAIL_AVG_MAX_PERCENT: u64 = 95;

/// Statistics for one neighbor station, as supplied by the pinger
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationStats {
    /// Expected transmit rate in 100 kbps units; 0 means unknown.
    pub expected_tx_rate_100kbps: u32,
    /// Fraction of transmitted frames that needed a retry, in `[0, 1]`.
    pub frame_fail_rate: f64,
    /// Monotonic timestamp (ms) when the pinger last heard this neighbor.
    pub last_seen_ms: u64,
}

/// Compute the airtime link metric for a neighbor.
///
/// Returns [`METRIC_INFINITY`] when the rate is unknown or the link loses
/// more than [`FAIL_AVG_MAX_PERCENT`] of frames.
#[must_use]
pub fn airtime_link_metric(stats: &StationStats) -> u32 {
    let rate = u64::from(stats.expected_tx_rate_100kbps);
    if rate == 0 {
        return METRIC_INFINITY;
    }

    let fail_avg = (stats.frame_fail_rate.clamp(0.0, 1.0) * 100.0).round() as u64;
    if fail_avg > FAIL_AVG_MAX_PERCENT {
        return METRIC_INFINITY;
    }

    // Rate is in 100 kbps units while the frame time wants Mbps; the
    // factor 10 corrects for that.
    let tx_time = DEVICE_CONSTANT + 10 * TEST_FRAME_LEN / rate;
    let err = (fail_avg << ARITH_SHIFT) / 100;
    let estimated_retx = (1u64 << (2 * ARITH_SHIFT)) / (S_UNIT - err);
    let result = (tx_time * estimated_retx) >> (2 * ARITH_SHIFT);

    u32::try_from(result).unwrap_or(METRIC_INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rate: u32, fail: f64) -> StationStats {
        StationStats {
            expected_tx_rate_100kbps: rate,
            frame_fail_rate: fail,
            last_seen_ms: 0,
        }
    }

    #[test]
    fn unknown_rate_is_infinite() {
        assert_eq!(airtime_link_metric(&stats(0, 0.0)), METRIC_INFINITY);
    }

    #[test]
    fn lossy_link_is_infinite() {
        assert_eq!(airtime_link_metric(&stats(100, 0.96)), METRIC_INFINITY);
        assert_ne!(airtime_link_metric(&stats(100, 0.95)), METRIC_INFINITY);
    }

    #[test]
    fn one_mbps_clean_link() {
        // tx_time = 256 + 81920/10 = 8448; retx = 256; 8448*256 >> 16 = 33
        assert_eq!(airtime_link_metric(&stats(10, 0.0)), 33);
    }

    #[test]
    fn faster_links_are_cheaper() {
        let slow = airtime_link_metric(&stats(60, 0.0));
        let fast = airtime_link_metric(&stats(6500, 0.0));
        assert!(fast < slow);
    }

    #[test]
    fn failures_inflate_the_metric() {
        let clean = airtime_link_metric(&stats(100, 0.0));
        let noisy = airtime_link_metric(&stats(100, 0.5));
        assert!(noisy > clean);
    }

    #[test]
    fn fail_rate_is_clamped() {
        // Out-of-range inputs behave like their clamped value.
        assert_eq!(
            airtime_link_metric(&stats(100, -3.0)),
            airtime_link_metric(&stats(100, 0.0))
        );
        assert_eq!(airtime_link_metric(&stats(100, 7.5)), METRIC_INFINITY);
    }
}
