//! The in-memory prefix database.

use std::collections::{HashMap, HashSet};

use crate::types::{IpPrefix, PrefixEntry, PrefixType};

/// Mapping of prefix to advertisement entry; at most one entry per prefix.
///
/// Owned and serialized by the prefix manager's event loop; no internal
/// locking.
#[derive(Debug, Default)]
#[must_use]
pub struct PrefixMap {
    entries: HashMap<IpPrefix, PrefixEntry>,
}

impl PrefixMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Rebuild a map from loaded entries. Later duplicates win, matching
    /// insertion into a fresh map.
    pub fn from_entries(entries: impl IntoIterator<Item = PrefixEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.prefix, e)).collect(),
        }
    }

    /// Insert missing entries and replace changed ones.
    ///
    /// Returns true iff any insertion or replacement occurred.
    pub fn add_or_update(&mut self, prefixes: &[PrefixEntry]) -> bool {
        let mut updated = false;
        for entry in prefixes {
            match self.entries.get_mut(&entry.prefix) {
                None => {
                    tracing::info!(prefix = %entry.prefix, client = %entry.prefix_type, "advertising prefix");
                    self.entries.insert(entry.prefix, entry.clone());
                    updated = true;
                }
                Some(existing) if *existing != *entry => {
                    tracing::info!(prefix = %entry.prefix, client = %entry.prefix_type, "advertising prefix");
                    *existing = entry.clone();
                    updated = true;
                }
                Some(_) => {}
            }
        }
        updated
    }

    /// Remove the given entries, all or nothing.
    ///
    /// Every `(prefix, type)` pair must match an existing entry, otherwise
    /// the whole call fails and the map is unchanged.
    pub fn remove(&mut self, prefixes: &[PrefixEntry]) -> bool {
        for entry in prefixes {
            match self.entries.get(&entry.prefix) {
                Some(existing) if existing.prefix_type == entry.prefix_type => {}
                _ => {
                    tracing::info!(
                        prefix = %entry.prefix,
                        client = %entry.prefix_type,
                        "cannot withdraw prefix"
                    );
                    return false;
                }
            }
        }

        for entry in prefixes {
            tracing::info!(prefix = %entry.prefix, client = %entry.prefix_type, "withdrawing prefix");
            self.entries.remove(&entry.prefix);
        }
        true
    }

    /// Erase every entry of the given type. Returns true iff any removed.
    pub fn remove_by_type(&mut self, prefix_type: PrefixType) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.prefix_type != prefix_type);
        before != self.entries.len()
    }

    /// Replace the subset of the map with the given type by `prefixes`:
    /// delete entries of that type whose prefix is not in the input, then
    /// add-or-update the input. Returns true iff anything changed.
    pub fn sync_by_type(&mut self, prefix_type: PrefixType, prefixes: &[PrefixEntry]) -> bool {
        let keep: HashSet<IpPrefix> = prefixes.iter().map(|e| e.prefix).collect();

        let before = self.entries.len();
        self.entries
            .retain(|prefix, e| e.prefix_type != prefix_type || keep.contains(prefix));
        let mut updated = before != self.entries.len();

        updated |= self.add_or_update(prefixes);
        updated
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn get_all(&self) -> Vec<PrefixEntry> {
        self.entries.values().cloned().collect()
    }

    /// Snapshot of entries with the given type.
    #[must_use]
    pub fn get_by_type(&self, prefix_type: PrefixType) -> Vec<PrefixEntry> {
        self.entries
            .values()
            .filter(|e| e.prefix_type == prefix_type)
            .cloned()
            .collect()
    }

    /// Snapshot of the persistent subset.
    #[must_use]
    pub fn persistent_entries(&self) -> Vec<PrefixEntry> {
        self.entries
            .values()
            .filter(|e| e.is_persistent())
            .cloned()
            .collect()
    }

    /// Whether any input entry is persistent.
    #[must_use]
    pub fn any_input_persistent(prefixes: &[PrefixEntry]) -> bool {
        prefixes.iter().any(PrefixEntry::is_persistent)
    }

    /// Whether any existing entry matching an input prefix is persistent.
    #[must_use]
    pub fn any_existing_persistent(&self, prefixes: &[PrefixEntry]) -> bool {
        prefixes
            .iter()
            .filter_map(|e| self.entries.get(&e.prefix))
            .any(PrefixEntry::is_persistent)
    }

    /// Whether any existing entry of the given type is persistent.
    #[must_use]
    pub fn any_existing_persistent_by_type(&self, prefix_type: PrefixType) -> bool {
        self.entries
            .values()
            .filter(|e| e.prefix_type == prefix_type)
            .any(|e| e.is_persistent())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
