//! Counters context and monitor submission seam.
//!
//! Each subsystem loop owns a [`Counters`] instance (no global state) and
//! periodically hands a snapshot to a [`MonitorClient`]. The monitoring
//! transport itself is an external collaborator behind the trait.

use std::collections::HashMap;

/// Integer counters collected by a single event loop.
///
/// Count-style keys are bumped on events; gauge-style keys are overwritten
/// with the latest observation just before submission.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    values: HashMap<String, i64>,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a count-style counter by one.
    pub fn bump(&mut self, key: &str) {
        *self.values.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Overwrite a gauge-style counter.
    pub fn set_gauge(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), value);
    }

    /// Current value of a counter, zero if never touched.
    #[must_use]
    pub fn get(&self, key: &str) -> i64 {
        self.values.get(key).copied().unwrap_or(0)
    }

    /// Copy of all counters for submission.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.values.clone()
    }
}

/// Sink for periodic counter submission.
pub trait MonitorClient: Send {
    fn set_counters(&mut self, counters: &HashMap<String, i64>);
}

/// Monitor that logs submissions at DEBUG. Default wiring for the daemon
/// when no external monitor is injected.
#[derive(Debug, Default)]
pub struct LogMonitor;

impl MonitorClient for LogMonitor {
    fn set_counters(&mut self, counters: &HashMap<String, i64>) {
        tracing::debug!(count = counters.len(), "submitting counters");
        for (key, value) in counters {
            tracing::trace!(%key, value, "counter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_get() {
        let mut counters = Counters::new();
        assert_eq!(counters.get("a.b"), 0);
        counters.bump("a.b");
        counters.bump("a.b");
        assert_eq!(counters.get("a.b"), 2);
    }

    #[test]
    fn gauge_overwrites() {
        let mut counters = Counters::new();
        counters.set_gauge("queue", 5);
        counters.set_gauge("queue", 3);
        assert_eq!(counters.get("queue"), 3);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut counters = Counters::new();
        counters.bump("a");
        let snap = counters.snapshot();
        counters.bump("a");
        assert_eq!(snap.get("a"), Some(&1));
        assert_eq!(counters.get("a"), 2);
    }
}
