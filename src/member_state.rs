//! src/member_state.rs
//!
//! `MemberState`: the unit of durability and of gossip exchange. Bundles the
//! vector clock, the ring, and the opaque arguments the node was first
//! configured with.

use crate::clock::VectorClock;
use crate::domain::Ring;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    pub clock: VectorClock,
    pub ring: Ring,
    /// Opaque initial configuration payload (the arguments the join-type
    /// `init` call was first seeded with). Not interpreted by the state
    /// machine; carried along purely for operator/debugging visibility.
    pub args: serde_json::Value,
}

impl MemberState {
    pub fn empty() -> Self {
        Self {
            clock: VectorClock::new(),
            ring: Ring::new(),
            args: serde_json::Value::Null,
        }
    }

    /// Structural equality used by `states()` grouping (spec §4.1): same
    /// Clock and same Ring, independent of any incidental Vec ordering —
    /// `Ring`'s `PartialEq` already compares the canonical sorted form
    /// indirectly through its own invariant (it is always kept sorted).
    pub fn state_eq(&self, other: &MemberState) -> bool {
        self.clock == other.clock && self.ring == other.ring
    }

    /// Conflict-resolution merge per spec §4.4: clocks pointwise-max,
    /// rings resolved by the deterministic `Ring::merge` tiebreak. `args`
    /// is carried from whichever side contributes a non-null value,
    /// preferring `local` since it is this node's own configuration.
    pub fn merge(remote: &MemberState, local: &MemberState) -> MemberState {
        MemberState {
            clock: VectorClock::merge(&remote.clock, &local.clock),
            ring: Ring::merge(&remote.ring, &local.ring),
            args: if local.args.is_null() {
                remote.args.clone()
            } else {
                local.args.clone()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeEntry, NodeId, NodeOptions};

    fn state_with(node: &str, ring_ids: &[&str]) -> MemberState {
        let mut clock = VectorClock::new();
        clock.increment(&NodeId::new(node));
        let entries = ring_ids
            .iter()
            .enumerate()
            .map(|(i, id)| NodeEntry::new((i + 1) as u64, NodeId::new(*id), NodeOptions::new()))
            .collect();
        MemberState {
            clock,
            ring: crate::domain::Ring::from_entries(entries),
            args: serde_json::Value::Null,
        }
    }

    #[test]
    fn merge_is_commutative() {
        let a = state_with("n1", &["n1"]);
        let b = state_with("n2", &["n2"]);
        let merged_ab = MemberState::merge(&a, &b);
        let merged_ba = MemberState::merge(&b, &a);
        assert!(merged_ab.state_eq(&merged_ba));
    }

    #[test]
    fn merge_is_idempotent() {
        let a = state_with("n1", &["n1", "n2"]);
        let merged = MemberState::merge(&a, &a);
        assert!(merged.state_eq(&a));
    }
}
