//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use crate::domain::NodeId;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Failed to initiate connection to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] quinn::ConnectError),

    #[error("Connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(SocketAddr, #[source] quinn::ConnectionError),

    #[error("An established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("RPC to {0} timed out")]
    Timeout(NodeId),

    #[error("peer {0} has no known address")]
    UnknownPeer(NodeId),

    // --- Membership protocol error kinds (spec §7) ---
    #[error("node_exists_at_position_{0}")]
    NodeExistsAtPosition(u64),

    #[error("position_exists_{0}")]
    PositionExists(u64),

    #[error("unknown_join_type")]
    UnknownJoinType,

    #[error("bad_mem_state_file")]
    BadMemStateFile,

    #[error("mem_state_file_not_found")]
    MemStateFileNotFound,

    #[error("bad_state_match for {self_id}: mismatching nodes {mismatching:?}")]
    BadStateMatch {
        self_id: NodeId,
        mismatching: Vec<NodeId>,
    },

    #[error("unknown_gossip_response")]
    UnknownGossipResponse,

    #[error("no_gossip_targets_available")]
    NoGossipTargetsAvailable,

    #[error("not_reset")]
    NotReset,
}
