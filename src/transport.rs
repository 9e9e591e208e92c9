//! src/transport.rs
//!
//! The Transport Adapter capability set (spec §9): `call_peer` / `cast_peer`
//! / `ping` / `subscribe` / `up_set`. Kept as a small `async_trait` so the
//! Service Shell and Gossip Engine can be driven either by the real
//! QUIC-backed adapter (`quic_transport.rs`) or, in tests and `test`-mode
//! runs, by `LoopbackTransport` below — spec §6's `test` flag disables
//! RPC-based state fetch and gossip, which in this implementation means
//! swapping in the loopback adapter rather than branching throughout the
//! state machine.

use crate::domain::NodeId;
use crate::error::{Error, Result};
use crate::member_state::MemberState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// The request half of the peer RPC surface (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    State,
    Gossip(MemberState),
    Ping,
}

/// The reply half, matching spec §4.3's inbound-gossip action table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    State(MemberState),
    Ok,
    NewState(MemberState),
    Pong,
}

/// A liveness transition reported by the transport's underlying monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessEvent {
    Up(NodeId),
    Down(NodeId),
}

/// The capability set a `ServiceShell` and `GossipEngine` are driven
/// through. Object-safe via `async_trait` so either a real QUIC transport
/// or an in-memory loopback can be injected.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Synchronous request/reply to `node`, bounded by `timeout`. Spec §5:
    /// one of the only two blocking peer interactions allowed on the
    /// Service Shell's loop (the other is rejoin).
    async fn call_peer(
        &self,
        node: &NodeId,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse>;

    /// Fire-and-forget send; used for cast-mode gossip on `nodeup`.
    async fn cast_peer(&self, node: &NodeId, request: RpcRequest) -> Result<()>;

    /// Forces liveness detection of `node` (spec §4.2's `init` join type).
    async fn ping(&self, node: &NodeId) -> Result<()>;

    /// A stream of up/down transitions as observed by the transport.
    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent>;

    /// The set of peers currently believed reachable.
    async fn up_set(&self) -> HashSet<NodeId>;
}

/// A minimal interface a node exposes to receive RPCs from peers over the
/// loopback transport — the in-memory analogue of "the same service name
/// on both ends" from spec §6. The QUIC transport's connection handler
/// plays this same role against a real wire request; here it is called
/// directly, in-process.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn handle_request(&self, request: RpcRequest) -> RpcResponse;
}

struct PeerRegistration {
    endpoint: Arc<dyn PeerEndpoint>,
    up: bool,
}

/// Shared in-memory network backing every node's `LoopbackTransport` in a
/// test. Lets tests simulate a whole cluster — joins, gossip, liveness
/// flaps — without binding any real sockets.
#[derive(Clone)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<NodeId, PeerRegistration>>>,
    liveness: broadcast::Sender<LivenessEvent>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        let (liveness, _) = broadcast::channel(256);
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            liveness,
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node's endpoint as reachable (up).
    pub fn register(&self, node: NodeId, endpoint: Arc<dyn PeerEndpoint>) {
        self.peers.lock().unwrap().insert(
            node.clone(),
            PeerRegistration { endpoint, up: true },
        );
        let _ = self.liveness.send(LivenessEvent::Up(node));
    }

    pub fn set_down(&self, node: &NodeId) {
        if let Some(reg) = self.peers.lock().unwrap().get_mut(node) {
            reg.up = false;
        }
        let _ = self.liveness.send(LivenessEvent::Down(node.clone()));
    }

    pub fn set_up(&self, node: &NodeId) {
        if let Some(reg) = self.peers.lock().unwrap().get_mut(node) {
            reg.up = true;
        }
        let _ = self.liveness.send(LivenessEvent::Up(node.clone()));
    }

    pub fn for_node(&self, self_id: NodeId) -> LoopbackTransport {
        LoopbackTransport {
            self_id,
            network: self.clone(),
        }
    }
}

/// A `TransportAdapter` backed entirely by in-process channels, used for
/// unit/integration tests and for nodes started with `test: true` in
/// config (spec §6).
#[derive(Clone)]
pub struct LoopbackTransport {
    self_id: NodeId,
    network: LoopbackNetwork,
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    async fn call_peer(
        &self,
        node: &NodeId,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let registration_endpoint = {
            let peers = self.network.peers.lock().unwrap();
            let reg = peers.get(node).ok_or_else(|| Error::UnknownPeer(node.clone()))?;
            if !reg.up {
                return Err(Error::Timeout(node.clone()));
            }
            reg.endpoint.clone()
        };

        tokio::time::timeout(timeout, registration_endpoint.handle_request(request))
            .await
            .map_err(|_| Error::Timeout(node.clone()))
    }

    async fn cast_peer(&self, node: &NodeId, request: RpcRequest) -> Result<()> {
        let endpoint = {
            let peers = self.network.peers.lock().unwrap();
            let reg = peers.get(node).ok_or_else(|| Error::UnknownPeer(node.clone()))?;
            if !reg.up {
                return Err(Error::Timeout(node.clone()));
            }
            reg.endpoint.clone()
        };
        let _ = endpoint.handle_request(request).await;
        Ok(())
    }

    async fn ping(&self, node: &NodeId) -> Result<()> {
        let peers = self.network.peers.lock().unwrap();
        if peers.get(node).map(|r| r.up).unwrap_or(false) {
            Ok(())
        } else {
            Err(Error::Timeout(node.clone()))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.network.liveness.subscribe()
    }

    async fn up_set(&self) -> HashSet<NodeId> {
        self.network
            .peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, reg)| reg.up && **id != self.self_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member_state::MemberState;

    struct EchoEndpoint;

    #[async_trait]
    impl PeerEndpoint for EchoEndpoint {
        async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::State => RpcResponse::State(MemberState::empty()),
                RpcRequest::Gossip(_) => RpcResponse::Ok,
                RpcRequest::Ping => RpcResponse::Pong,
            }
        }
    }

    #[tokio::test]
    async fn call_peer_returns_endpoint_response() {
        let network = LoopbackNetwork::new();
        network.register(NodeId::new("n2"), Arc::new(EchoEndpoint));
        let transport = network.for_node(NodeId::new("n1"));

        let response = transport
            .call_peer(&NodeId::new("n2"), RpcRequest::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Pong));
    }

    #[tokio::test]
    async fn call_peer_unknown_node_errors() {
        let network = LoopbackNetwork::new();
        let transport = network.for_node(NodeId::new("n1"));
        let err = transport
            .call_peer(&NodeId::new("ghost"), RpcRequest::Ping, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn down_node_times_out() {
        let network = LoopbackNetwork::new();
        network.register(NodeId::new("n2"), Arc::new(EchoEndpoint));
        network.set_down(&NodeId::new("n2"));
        let transport = network.for_node(NodeId::new("n1"));

        let err = transport
            .call_peer(&NodeId::new("n2"), RpcRequest::Ping, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn up_set_excludes_self_and_down_nodes() {
        let network = LoopbackNetwork::new();
        network.register(NodeId::new("n1"), Arc::new(EchoEndpoint));
        network.register(NodeId::new("n2"), Arc::new(EchoEndpoint));
        network.register(NodeId::new("n3"), Arc::new(EchoEndpoint));
        network.set_down(&NodeId::new("n3"));

        let transport = network.for_node(NodeId::new("n1"));
        let up = transport.up_set().await;
        assert_eq!(up, HashSet::from([NodeId::new("n2")]));
    }
}
