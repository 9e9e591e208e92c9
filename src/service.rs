//! src/service.rs
//!
//! The Service Shell (spec §4.1): the single-writer actor that owns the
//! node's `MemberState` and serialises every operation — local calls,
//! inbound gossip, and liveness notifications — through one mailbox.
//! Generalizes the teacher's `Engine::run` (a `tokio::select!` over a
//! gossip timer, an inbound-message channel, and a connection-event
//! channel) into a request/reply mailbox where synchronous calls attach a
//! `oneshot` reply channel and casts don't, per spec §9.

use crate::clock::VectorClock;
use crate::domain::{NodeEntry, NodeId, NodeOptions};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::gossip::GossipEngine;
use crate::member_state::MemberState;
use crate::state_machine::StateMachine;
use crate::store::StateStore;
use crate::transport::{LivenessEvent, PeerEndpoint, RpcRequest, RpcResponse, TransportAdapter};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// The four join types spec §4.2 defines. An unrecognised token from an
/// external caller (CLI/admin, spec §6) fails `FromStr` with
/// `unknown_join_type` rather than being representable at all internally.
#[derive(Clone, Debug)]
pub enum JoinType {
    Init,
    Join,
    Replace,
    Leave,
}

impl FromStr for JoinType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(JoinType::Init),
            "join" => Ok(JoinType::Join),
            "replace" => Ok(JoinType::Replace),
            "leave" => Ok(JoinType::Leave),
            _ => Err(Error::UnknownJoinType),
        }
    }
}

/// The payload shape, per join type, spec §4.2.
#[derive(Clone, Debug)]
pub enum JoinPayload {
    Entries(Vec<NodeEntry>),
    Replace {
        old_node_id: NodeId,
        new_options: NodeOptions,
    },
    Leave {
        node_id: NodeId,
    },
}

#[derive(Clone, Debug)]
pub struct JoinRequest {
    pub join_type: JoinType,
    pub payload: JoinPayload,
    pub ping_node: Option<NodeId>,
}

/// The result of `states()` (spec §4.1): peers grouped by equal MemberState,
/// plus the two special buckets.
#[derive(Clone, Debug, Default)]
pub struct StatesReport {
    pub groups: Vec<(MemberState, Vec<NodeId>)>,
    pub bad_nodes: Vec<NodeId>,
    pub non_member_nodes: Vec<NodeId>,
}

enum Command {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    Clock {
        reply: oneshot::Sender<VectorClock>,
    },
    State {
        reply: oneshot::Sender<MemberState>,
    },
    States {
        reply: oneshot::Sender<StatesReport>,
    },
    Nodes {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    FullNodes {
        reply: oneshot::Sender<Vec<NodeEntry>>,
    },
    StartGossip {
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        reply: oneshot::Sender<Result<()>>,
    },
    Gossip {
        remote: MemberState,
        reply: oneshot::Sender<RpcResponse>,
    },
    NodeUp(NodeId),
    NodeDown(NodeId),
    Stop,
}

/// A cheap, cloneable front door to the Service Shell's mailbox. This is
/// what the rest of the process (CLI/admin glue, the transport's inbound
/// RPC handler) talks to; the actor itself never leaves `run`.
#[derive(Clone)]
pub struct ServiceShellHandle {
    tx: mpsc::Sender<Command>,
}

/// The other end of a handle's mailbox, opaque to callers. Exists so
/// `app.rs` can hand a `PeerEndpoint`-capable handle to the transport
/// *before* the actor loop is spawned — the transport needs something to
/// route inbound RPCs to, and the actor needs the transport to place
/// outbound calls, so the channel is stood up first and wired both ways.
pub struct ServiceShellReceiver(mpsc::Receiver<Command>);

impl ServiceShellHandle {
    /// Creates the mailbox without starting the actor. Pair with
    /// `ServiceShell::spawn` once a `TransportAdapter` is available.
    pub fn new_channel(capacity: usize) -> (ServiceShellHandle, ServiceShellReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (ServiceShellHandle { tx }, ServiceShellReceiver(rx))
    }

    pub async fn join(&self, request: JoinRequest) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Join { request, reply })
            .await
            .map_err(|_| Error::NotReset)?;
        rx.await.map_err(|_| Error::NotReset)?
    }

    pub async fn clock(&self) -> VectorClock {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Clock { reply }).await.is_err() {
            return VectorClock::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn state(&self) -> MemberState {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::State { reply }).await.is_err() {
            return MemberState::empty();
        }
        rx.await.unwrap_or_else(|_| MemberState::empty())
    }

    pub async fn states(&self) -> StatesReport {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::States { reply }).await.is_err() {
            return StatesReport::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn nodes(&self) -> Vec<NodeId> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Nodes { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn fullnodes(&self) -> Vec<NodeEntry> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::FullNodes { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn start_gossip(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StartGossip { reply })
            .await
            .map_err(|_| Error::NoGossipTargetsAvailable)?;
        rx.await.map_err(|_| Error::NoGossipTargetsAvailable)?
    }

    pub async fn reset(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reset { reply })
            .await
            .map_err(|_| Error::NotReset)?;
        rx.await.map_err(|_| Error::NotReset)?
    }

    /// Fed by the transport's liveness subscription; fire-and-forget.
    pub fn notify_node_up(&self, node: NodeId) {
        let _ = self.tx.try_send(Command::NodeUp(node));
    }

    pub fn notify_node_down(&self, node: NodeId) {
        let _ = self.tx.try_send(Command::NodeDown(node));
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

/// The Service Shell's `PeerEndpoint` side: how it answers RPCs arriving
/// from another node's transport. `join` is deliberately absent — spec §6
/// states it is local-only and never accepted from remote peers.
#[async_trait]
impl PeerEndpoint for ServiceShellHandle {
    async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Ping => RpcResponse::Pong,
            RpcRequest::State => RpcResponse::State(self.state().await),
            RpcRequest::Gossip(remote) => {
                let (reply, rx) = oneshot::channel();
                if self.tx.send(Command::Gossip { remote, reply }).await.is_err() {
                    return RpcResponse::Ok;
                }
                rx.await.unwrap_or(RpcResponse::Ok)
            }
        }
    }
}

/// The actor itself: owns `MemberState` and everything needed to mutate,
/// persist, and gossip it.
struct ServiceLoop {
    self_id: NodeId,
    state: MemberState,
    state_machine: StateMachine,
    gossip: GossipEngine,
    transport: Arc<dyn TransportAdapter>,
    events: EventBus,
    test: bool,
    states_timeout: Duration,
    rejoin_timeout: Duration,
    rx: mpsc::Receiver<Command>,
}

pub struct ServiceShell;

impl ServiceShell {
    /// Loads the last snapshot (unless `test`), wires up the State Machine
    /// and Gossip Engine, and spawns the actor against an already-created
    /// mailbox (see `ServiceShellHandle::new_channel`). Returns the task so
    /// the caller (`app.rs`) can await it on shutdown.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        receiver: ServiceShellReceiver,
        self_id: NodeId,
        store: StateStore,
        events: EventBus,
        transport: Arc<dyn TransportAdapter>,
        test: bool,
        rpc_timeout: Duration,
        states_timeout: Duration,
        rejoin_timeout: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let initial_state = if test {
            MemberState::empty()
        } else {
            match store.read() {
                Ok(state) => state,
                Err(Error::BadMemStateFile) | Err(Error::MemStateFileNotFound) => {
                    tracing::info!(%self_id, "no prior membership snapshot, starting empty");
                    MemberState::empty()
                }
                Err(e) => {
                    tracing::warn!(%self_id, error = %e, "failed to read membership snapshot, starting empty");
                    MemberState::empty()
                }
            }
        };

        let state_machine = StateMachine::new(self_id.clone(), store.clone(), events.clone(), test);
        let gossip = GossipEngine::new(self_id.clone(), transport.clone(), store, test, rpc_timeout);

        let actor = ServiceLoop {
            self_id,
            state: initial_state,
            state_machine,
            gossip,
            transport,
            events,
            test,
            states_timeout,
            rejoin_timeout,
            rx: receiver.0,
        };

        tokio::spawn(actor.run(shutdown))
    }
}

impl ServiceLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        self.rejoin().await;
        let mut liveness_rx = self.transport.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(self_id = %self.self_id, "service shell received shutdown signal");
                    break;
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command::Stop) => {
                            tracing::info!(self_id = %self.self_id, "service shell stopping");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = liveness_rx.recv() => {
                    match event {
                        Ok(event) => self.handle_liveness(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(self_id = %self.self_id, skipped, "liveness events lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Join { request, reply } => {
                let result = self.handle_join(request).await;
                let _ = reply.send(result);
            }
            Command::Clock { reply } => {
                let _ = reply.send(self.state.clock.clone());
            }
            Command::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Command::States { reply } => {
                let report = self.handle_states().await;
                let _ = reply.send(report);
            }
            Command::Nodes { reply } => {
                let _ = reply.send(self.state.ring.node_ids());
            }
            Command::FullNodes { reply } => {
                let _ = reply.send(self.state.ring.entries().to_vec());
            }
            Command::StartGossip { reply } => {
                self.gossip_best_effort().await;
                let _ = reply.send(Ok(()));
            }
            Command::Reset { reply } => {
                let result = self.handle_reset();
                let _ = reply.send(result);
            }
            Command::Gossip { remote, reply } => {
                let response = self
                    .gossip
                    .handle_gossip(&mut self.state, remote, true)
                    .await
                    .unwrap_or(RpcResponse::Ok);
                let _ = reply.send(response);
            }
            Command::NodeUp(node) => self.handle_liveness(LivenessEvent::Up(node)).await,
            Command::NodeDown(node) => self.handle_liveness(LivenessEvent::Down(node)).await,
            Command::Stop => {}
        }
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<()> {
        match (request.join_type, request.payload) {
            (JoinType::Init, JoinPayload::Entries(entries)) => {
                for entry in &entries {
                    let _ = self.transport.ping(&entry.node_id).await;
                }
                self.state_machine.join_entries(&mut self.state, entries)?;
                self.gossip_best_effort().await;
                Ok(())
            }
            (JoinType::Join, JoinPayload::Entries(entries)) => {
                self.adopt_ping_node_state(request.ping_node.as_ref()).await?;
                self.state_machine.join_entries(&mut self.state, entries)?;
                self.gossip_best_effort().await;
                Ok(())
            }
            (
                JoinType::Replace,
                JoinPayload::Replace {
                    old_node_id,
                    new_options,
                },
            ) => {
                self.adopt_ping_node_state(request.ping_node.as_ref()).await?;
                self.state_machine
                    .replace(&mut self.state, &old_node_id, new_options)?;
                self.gossip_best_effort().await;
                Ok(())
            }
            (JoinType::Leave, JoinPayload::Leave { node_id }) => {
                self.state_machine.leave(node_id);
                Ok(())
            }
            _ => Err(Error::UnknownJoinType),
        }
    }

    /// A gossip round failing (no up peer to reach, e.g. a lone node) is not
    /// a failure of the join/start_gossip operation that triggered it — the
    /// mutation already landed locally and will propagate on the next round.
    async fn gossip_best_effort(&mut self) {
        if let Err(e) = self.gossip.gossip_call(&mut self.state).await {
            tracing::warn!(error = %e, "gossip round failed, continuing");
        }
    }

    /// spec §4.2: `join`/`replace` fetch the `pingNode`'s state and adopt it
    /// as the starting point before mutating. In test mode the local state
    /// is used instead (no RPC), per spec §6.
    async fn adopt_ping_node_state(&mut self, ping_node: Option<&NodeId>) -> Result<()> {
        if self.test {
            return Ok(());
        }
        let Some(ping_node) = ping_node else {
            return Ok(());
        };
        match self
            .transport
            .call_peer(ping_node, RpcRequest::State, self.states_timeout)
            .await?
        {
            RpcResponse::State(remote_state) => {
                self.state = remote_state;
                Ok(())
            }
            _ => Err(Error::UnknownGossipResponse),
        }
    }

    async fn handle_states(&self) -> StatesReport {
        let ring_ids = self.state.ring.node_ids();
        let mut report = StatesReport::default();

        for node in &ring_ids {
            if node == &self.self_id {
                Self::insert_group(&mut report.groups, self.state.clone(), node.clone());
                continue;
            }
            match self
                .transport
                .call_peer(node, RpcRequest::State, self.states_timeout)
                .await
            {
                Ok(RpcResponse::State(state)) => {
                    Self::insert_group(&mut report.groups, state, node.clone())
                }
                _ => report.bad_nodes.push(node.clone()),
            }
        }

        let up = self.transport.up_set().await;
        report.non_member_nodes = up.into_iter().filter(|n| !ring_ids.contains(n)).collect();
        report
    }

    fn insert_group(groups: &mut Vec<(MemberState, Vec<NodeId>)>, state: MemberState, node: NodeId) {
        if let Some((_, members)) = groups.iter_mut().find(|(s, _)| s.state_eq(&state)) {
            members.push(node);
        } else {
            groups.push((state, vec![node]));
        }
    }

    fn handle_reset(&mut self) -> Result<()> {
        if self.test {
            self.state = MemberState::empty();
            Ok(())
        } else {
            Err(Error::NotReset)
        }
    }

    async fn handle_liveness(&mut self, event: LivenessEvent) {
        match event {
            LivenessEvent::Down(node) => {
                self.events.emit(EventKind::NodeDown, node);
            }
            LivenessEvent::Up(node) => {
                if self.state.ring.find_node(&node).is_some() {
                    self.events.emit(EventKind::NodeUp, node);
                }
                self.gossip.gossip_cast(&self.state).await;
            }
        }
    }

    /// spec §4.6: on startup with a restored Ring, ping and query every
    /// member; reset to empty state on any disagreement.
    async fn rejoin(&mut self) {
        if self.test {
            return;
        }
        let ring_ids = self.state.ring.node_ids();
        if ring_ids.is_empty() {
            return;
        }

        let mut mismatching = Vec::new();
        for node in &ring_ids {
            if node == &self.self_id {
                continue;
            }
            let _ = self.transport.ping(node).await;
            if let Ok(RpcResponse::State(remote)) = self
                .transport
                .call_peer(node, RpcRequest::State, self.rejoin_timeout)
                .await
            {
                if !self.state.clock.equals(&remote.clock) {
                    mismatching.push(node.clone());
                }
            }
        }

        if !mismatching.is_empty() {
            let err = Error::BadStateMatch {
                self_id: self.self_id.clone(),
                mismatching,
            };
            tracing::warn!(self_id = %self.self_id, error = %err, "rejoin found disagreement, resetting to empty state");
            self.state = MemberState::empty();
        } else {
            tracing::info!(self_id = %self.self_id, "rejoin confirmed agreement with all reachable peers");
        }
    }
}
