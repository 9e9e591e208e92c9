//! src/domain.rs
//!
//! Consolidates the core ring-membership data model: `NodeId`, `NodeOptions`,
//! `NodeEntry`, and the `Ring` itself. This module is the single source of
//! truth for the total deterministic ordering the gossip merge (§4.4 of the
//! spec) relies on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Position 0 is the reserved sentinel used by legacy single-node init; it
/// must never survive a comparison, merge, or notification.
pub const SENTINEL_POSITION: u64 = 0;

/// An opaque, globally-unique node identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId::new(s)
    }
}

/// Per-node options. Currently recognises one key: `hints`, an ordered list
/// of partition identifiers this node additionally takes responsibility
/// for. Modelled as an open map (rather than a fixed struct) so future keys
/// can be added without a wire-format break, but canonicalised via a
/// `BTreeMap` so two option maps built in different insertion order still
/// compare and serialize identically — required for the total order below.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions(BTreeMap<String, serde_json::Value>);

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hints(hints: Vec<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert("hints".to_string(), serde_json::json!(hints));
        Self(map)
    }

    pub fn hints(&self) -> Vec<String> {
        self.0
            .get("hints")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Canonical string form used for deterministic ordering: `BTreeMap`
    /// already sorts keys, so `serde_json::to_string` is stable across
    /// equivalent maps built in any insertion order.
    fn canonical(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl PartialOrd for NodeOptions {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeOptions {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

/// A single member of the ring: its fixed position, its identity, and its
/// options. `Position` is 1-based and assigned at join time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub position: u64,
    pub node_id: NodeId,
    pub options: NodeOptions,
}

impl NodeEntry {
    pub fn new(position: u64, node_id: NodeId, options: NodeOptions) -> Self {
        Self {
            position,
            node_id,
            options,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.position == SENTINEL_POSITION
    }
}

/// Total deterministic order over `NodeEntry`: Position, then NodeId, then
/// canonicalised Options. Spec §4.4/§9 require this so that `min(remote,
/// local)` in a ring merge is well-defined identically on both sides of a
/// concurrent gossip exchange.
impl PartialOrd for NodeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.node_id.cmp(&other.node_id))
            .then_with(|| self.options.cmp(&other.options))
    }
}

/// The ordered sequence of `NodeEntry`, sorted by Position ascending. A
/// `Ring` is never mutated in place by anything outside `state_machine`;
/// consumers get cloned copies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring(Vec<NodeEntry>);

impl Ring {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_entries(mut entries: Vec<NodeEntry>) -> Self {
        entries.retain(|e| !e.is_sentinel());
        entries.sort_by(|a, b| a.position.cmp(&b.position));
        Self(entries)
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn find_position(&self, position: u64) -> Option<&NodeEntry> {
        self.0.iter().find(|e| e.position == position)
    }

    pub fn find_node(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        self.0.iter().find(|e| &e.node_id == node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.0.iter().map(|e| e.node_id.clone()).collect()
    }

    /// Appends `entries` (already individually validated by the caller via
    /// `check_pos`), then re-sorts by Position. Sentinel entries are
    /// dropped defensively even here.
    pub fn append_and_sort(&mut self, entries: Vec<NodeEntry>) {
        self.0
            .extend(entries.into_iter().filter(|e| !e.is_sentinel()));
        self.0.sort_by(|a, b| a.position.cmp(&b.position));
    }

    pub fn replace_node(&mut self, old: &NodeId, new_entry: NodeEntry) {
        if let Some(slot) = self.0.iter_mut().find(|e| &e.node_id == old) {
            *slot = new_entry;
        }
    }

    /// Canonicalised, fully sorted, sentinel-free copy used for both
    /// equality comparisons (`states()` grouping) and merge.
    fn canonical(&self) -> Vec<NodeEntry> {
        let mut entries: Vec<NodeEntry> = self
            .0
            .iter()
            .filter(|e| !e.is_sentinel())
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        entries
    }

    /// Deterministic conflict-resolution merge (spec §4.4):
    /// drop sentinels, dedupe, sort both sides; if one is empty return the
    /// other; otherwise return the lexicographically smaller sorted ring.
    /// Both ends of a concurrent gossip exchange compute the same result.
    pub fn merge(remote: &Ring, local: &Ring) -> Ring {
        let remote_sorted = remote.canonical();
        let local_sorted = local.canonical();

        if remote_sorted.is_empty() {
            return Ring(local_sorted);
        }
        if local_sorted.is_empty() {
            return Ring(remote_sorted);
        }

        if remote_sorted <= local_sorted {
            Ring(remote_sorted)
        } else {
            Ring(local_sorted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pos: u64, id: &str) -> NodeEntry {
        NodeEntry::new(pos, NodeId::new(id), NodeOptions::new())
    }

    #[test]
    fn from_entries_drops_sentinel_and_sorts() {
        let ring = Ring::from_entries(vec![entry(0, "ghost"), entry(2, "b"), entry(1, "a")]);
        let ids: Vec<_> = ring.entries().iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn node_entry_total_order_by_position_then_id_then_options() {
        let a = entry(1, "a");
        let b = entry(1, "b");
        assert!(a < b);

        let mut with_hints = entry(2, "c");
        with_hints.options = NodeOptions::with_hints(vec!["p0".to_string()]);
        let without_hints = entry(2, "c");
        assert!(without_hints < with_hints);
    }

    #[test]
    fn merge_prefers_lexicographically_smaller_ring() {
        let ring_a = Ring::from_entries(vec![entry(1, "a")]);
        let ring_b = Ring::from_entries(vec![entry(1, "b")]);

        let merged_ab = Ring::merge(&ring_a, &ring_b);
        let merged_ba = Ring::merge(&ring_b, &ring_a);
        assert_eq!(merged_ab, merged_ba);
        assert_eq!(merged_ab.entries()[0].node_id.as_str(), "a");
    }

    #[test]
    fn merge_with_empty_side_returns_other() {
        let ring = Ring::from_entries(vec![entry(1, "a")]);
        let empty = Ring::new();
        assert_eq!(Ring::merge(&ring, &empty), ring);
        assert_eq!(Ring::merge(&empty, &ring), ring);
    }

    #[test]
    fn merge_is_idempotent() {
        let ring = Ring::from_entries(vec![entry(1, "a"), entry(2, "b")]);
        assert_eq!(Ring::merge(&ring, &ring), ring);
    }
}
