//! src/state_machine.rs
//!
//! The ring-membership State Machine (spec §4.2): `check_pos`, `int_join`,
//! and the `replace`/`leave` mutations built on top of it. Pure with
//! respect to the network — callers (the Service Shell) are responsible
//! for any RPC needed to obtain the starting `MemberState` (fetching the
//! `pingNode`'s state for `join`/`replace`) and for triggering a gossip
//! round once a mutation succeeds.

use crate::domain::{NodeEntry, NodeId, NodeOptions, Ring};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::member_state::MemberState;
use crate::store::StateStore;

/// Owns the pieces of a mutation that aren't the `MemberState` itself: this
/// node's identity, where snapshots land, and where events are published.
/// In `test` mode, persistence is skipped — matching spec §6's `test` flag.
pub struct StateMachine {
    self_id: NodeId,
    store: StateStore,
    events: EventBus,
    test: bool,
}

impl StateMachine {
    pub fn new(self_id: NodeId, store: StateStore, events: EventBus, test: bool) -> Self {
        Self {
            self_id,
            store,
            events,
            test,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// spec §4.2: an entry conflicts with an existing one at the same
    /// Position either because the same node is rejoining (`NodeExistsAtPosition`)
    /// or a different node already holds that Position (`PositionExists`).
    fn check_pos(ring: &Ring, position: u64, node_id: &NodeId) -> Result<()> {
        match ring.find_position(position) {
            Some(existing) if &existing.node_id == node_id => {
                Err(Error::NodeExistsAtPosition(position))
            }
            Some(_) => Err(Error::PositionExists(position)),
            None => Ok(()),
        }
    }

    /// The common path shared by `init`, `join`, and (with an empty entry
    /// list) `replace`: validate every new entry before mutating anything —
    /// a failed `check_pos` must leave the Ring untouched per spec §7 — then
    /// append, sort, bump the local clock, and persist.
    pub fn int_join(&self, state: &mut MemberState, new_entries: Vec<NodeEntry>) -> Result<()> {
        for entry in &new_entries {
            Self::check_pos(&state.ring, entry.position, &entry.node_id)?;
        }

        for entry in &new_entries {
            self.events.emit(EventKind::NodeJoin, entry.node_id.clone());
        }

        state.ring.append_and_sort(new_entries);
        state.clock.increment(&self.self_id);

        if !self.test {
            self.store.write(state)?;
        }

        Ok(())
    }

    /// `init`/`join`: the caller has already pinged the listed nodes (init)
    /// or fetched the starting state from `pingNode` (join) and hands us
    /// the resulting `state` to mutate in place.
    pub fn join_entries(&self, state: &mut MemberState, entries: Vec<NodeEntry>) -> Result<()> {
        self.int_join(state, entries)
    }

    /// `replace` (spec §4.2): `state` is the `pingNode`'s fetched state (or
    /// the local state in test mode). Locates `old_node_id`, replaces it in
    /// place with this node at the same Position, emits `node_leave`, and
    /// runs `int_join` with no new entries to bump the clock and persist.
    pub fn replace(
        &self,
        state: &mut MemberState,
        old_node_id: &NodeId,
        new_options: NodeOptions,
    ) -> Result<()> {
        let position = state
            .ring
            .find_node(old_node_id)
            .map(|e| e.position)
            .ok_or_else(|| Error::UnknownPeer(old_node_id.clone()))?;

        let replacement = NodeEntry::new(position, self.self_id.clone(), new_options);
        state.ring.replace_node(old_node_id, replacement);
        self.events.emit(EventKind::NodeLeave, old_node_id.clone());

        self.int_join(state, Vec::new())
    }

    /// `leave` (spec §4.2/§9): emits `node_leave` and returns ok without
    /// removing the NodeEntry or bumping the clock, mirroring the open
    /// question's option (a) for parity with the documented TODO.
    // TODO(spec §9 open question): extend to remove the NodeEntry from the
    // Ring and bump the clock once full-removal semantics are decided.
    pub fn leave(&self, node_id: NodeId) {
        self.events.emit(EventKind::NodeLeave, node_id);
    }
}
