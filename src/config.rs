//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// A known peer to seed the `AddressBook` with at startup, so `pingNode`,
/// gossip, and rejoin have somewhere to dial before this node has learned
/// any addresses of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub node_id: String,
    pub addr: SocketAddr,
}

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// This node's identifier in the cluster.
    pub self_id: String,
    /// Where the QUIC transport binds and accepts peer RPCs.
    pub bind_addr: SocketAddr,
    /// Peers to seed the `AddressBook` with at startup.
    pub bootstrap_peers: Vec<BootstrapPeer>,
    /// Directory membership snapshots are written to and read from.
    pub data_dir: PathBuf,
    /// Per-call timeout for `call_peer`-style synchronous gossip and
    /// `pingNode` state fetches.
    pub rpc_timeout_ms: u64,
    /// Per-call timeout used by `states()`'s multi-peer query.
    pub states_timeout_ms: u64,
    /// Per-call timeout used by automatic rejoin on startup.
    pub rejoin_timeout_ms: u64,
    /// Disables persistence, RPC-based state fetch, and gossip, and
    /// enables `reset()` — spec §6, used by the test harness only.
    pub test: bool,
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("MEMBERSHIP_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            self_id: "node-1".to_string(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000),
            bootstrap_peers: Vec::new(),
            data_dir: PathBuf::from("data"),
            rpc_timeout_ms: 2_000,
            states_timeout_ms: 5_000,
            rejoin_timeout_ms: 5_000,
            test: false,
        }
    }
}
