//! src/gossip.rs
//!
//! The Gossip Engine (spec §4.3): picks a peer and ships state
//! synchronously (call-mode, after a local mutation or on `start_gossip`)
//! or asynchronously (cast-mode, on `nodeup`), and resolves inbound gossip
//! against spec §4.3's conflict table. `next_up_node` is kept as its own
//! pure function with its own unit tests, the way the teacher isolates
//! peer selection in `engine/protocol.rs`.

use crate::clock::Comparison;
use crate::domain::{NodeId, Ring};
use crate::error::{Error, Result};
use crate::member_state::MemberState;
use crate::store::StateStore;
use crate::transport::{RpcRequest, RpcResponse, TransportAdapter};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// spec §4.3's peer-selection rule: treat the Ring's NodeIds as a circular
/// sequence, and starting immediately after `self_id`, return the first one
/// present in `up_set`. `None` if nothing qualifies (including an empty
/// Ring, which the caller should already have skipped).
pub fn next_up_node(ring: &Ring, self_id: &NodeId, up_set: &HashSet<NodeId>) -> Option<NodeId> {
    let ids = ring.node_ids();
    if ids.is_empty() {
        return None;
    }

    let start = ids.iter().position(|id| id == self_id).map(|i| i + 1).unwrap_or(0);
    let n = ids.len();
    (0..n)
        .map(|offset| &ids[(start + offset) % n])
        .find(|candidate| *candidate != self_id && up_set.contains(candidate))
        .cloned()
}

/// The outcome of applying spec §4.3's inbound conflict table to one
/// gossip message.
enum InboundDecision {
    ReplyOnly(RpcResponse),
    AdoptAndReply(MemberState, RpcResponse),
    AdoptSilently(MemberState),
}

fn decide_inbound(remote: &MemberState, local: &MemberState, sender_known: bool) -> InboundDecision {
    match remote.clock.compare(&local.clock) {
        Comparison::Equal => InboundDecision::ReplyOnly(RpcResponse::Ok),
        Comparison::Less => InboundDecision::ReplyOnly(RpcResponse::NewState(local.clone())),
        Comparison::Greater if sender_known => {
            InboundDecision::AdoptAndReply(remote.clone(), RpcResponse::Ok)
        }
        Comparison::Greater => InboundDecision::AdoptSilently(remote.clone()),
        Comparison::Concurrent => {
            let merged = MemberState::merge(remote, local);
            if sender_known {
                InboundDecision::AdoptAndReply(merged.clone(), RpcResponse::NewState(merged))
            } else {
                InboundDecision::AdoptSilently(merged)
            }
        }
    }
}

/// Drives outbound gossip and resolves inbound gossip requests. Does not
/// own the current `MemberState` — the Service Shell does — but is handed
/// a mutable reference for the duration of each call.
pub struct GossipEngine {
    self_id: NodeId,
    transport: Arc<dyn TransportAdapter>,
    store: StateStore,
    test: bool,
    call_timeout: Duration,
}

impl GossipEngine {
    pub fn new(
        self_id: NodeId,
        transport: Arc<dyn TransportAdapter>,
        store: StateStore,
        test: bool,
        call_timeout: Duration,
    ) -> Self {
        Self {
            self_id,
            transport,
            store,
            test,
            call_timeout,
        }
    }

    /// spec §4.3 call-mode: send `state` to one up peer and wait for a
    /// reply. A no-op in test mode or with an empty Ring.
    pub async fn gossip_call(&self, state: &mut MemberState) -> Result<()> {
        if self.test || state.ring.is_empty() {
            return Ok(());
        }

        let up = self.transport.up_set().await;
        let target = next_up_node(&state.ring, &self.self_id, &up)
            .ok_or(Error::NoGossipTargetsAvailable)?;

        let response = self
            .transport
            .call_peer(&target, RpcRequest::Gossip(state.clone()), self.call_timeout)
            .await?;

        match response {
            RpcResponse::Ok => Ok(()),
            RpcResponse::NewState(new_state) => self.adopt(state, new_state).await,
            _ => Err(Error::UnknownGossipResponse),
        }
    }

    /// spec §4.3 cast-mode: fire-and-forget, triggered on `nodeup`.
    pub async fn gossip_cast(&self, state: &MemberState) {
        if self.test || state.ring.is_empty() {
            return;
        }
        let up = self.transport.up_set().await;
        if let Some(target) = next_up_node(&state.ring, &self.self_id, &up) {
            let _ = self
                .transport
                .cast_peer(&target, RpcRequest::Gossip(state.clone()))
                .await;
        }
    }

    /// Resolves one inbound `{gossip, remote}` request against `current`
    /// per spec §4.3's table, mutating `current` on adoption and returning
    /// the response to send back (`None` for a cast, which has no reply).
    ///
    /// Adoption here only installs the new state — it does not chain into
    /// another outbound gossip round. Doing so before replying would mean
    /// calling back out to a peer while that peer's own mailbox is still
    /// blocked awaiting this very reply (trivially reentrant in a two-node
    /// ring); the next periodic or triggered round propagates it onward
    /// instead.
    pub async fn handle_gossip(
        &self,
        current: &mut MemberState,
        remote: MemberState,
        sender_known: bool,
    ) -> Option<RpcResponse> {
        match decide_inbound(&remote, current, sender_known) {
            InboundDecision::ReplyOnly(response) => Some(response),
            InboundDecision::AdoptAndReply(new_state, response) => {
                let _ = self.install(current, new_state);
                Some(response)
            }
            InboundDecision::AdoptSilently(new_state) => {
                let _ = self.install(current, new_state);
                None
            }
        }
    }

    /// Replaces `current` and persists it, without gossiping onward.
    fn install(&self, current: &mut MemberState, new_state: MemberState) -> Result<()> {
        *current = new_state;
        if !self.test {
            self.store.write(current)?;
        }
        Ok(())
    }

    /// The path a freshly-learned-via-reply state goes through when this
    /// node itself initiated the round (`gossip_call`'s `NewState` branch):
    /// install, then keep relaying it forward.
    async fn adopt(&self, current: &mut MemberState, new_state: MemberState) -> Result<()> {
        self.install(current, new_state)?;
        self.gossip_call(current).await
    }
}
