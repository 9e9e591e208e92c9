//! src/lib.rs
//!
//! Main library crate for the cluster-membership gossip service.
//! This file declares the module hierarchy and exports the primary public
//! interface for the library, allowing it to be used by other crates or for
//! integration testing.

pub mod app;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod gossip;
pub mod member_state;
pub mod quic_transport;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod transport;

pub use app::App;
pub use config::Config;
pub use error::Error;
