//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's state
//! and manages the lifecycle of all its concurrent services.

use crate::{
    config::Config,
    domain::NodeId,
    error::Result,
    events::EventBus,
    quic_transport::{AddressBook, QuicTransport},
    service::{ServiceShell, ServiceShellHandle},
    store::StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// The main run loop for the application.
    ///
    /// This function performs the following steps:
    ///   1. Stands up the Service Shell's mailbox (ahead of the transport,
    ///      which needs a handle to route inbound RPCs into).
    ///   2. Constructs the QUIC transport bound to the configured address.
    ///   3. Spawns the Service Shell actor, wired to that transport.
    ///   4. Waits for a shutdown signal (like Ctrl+C) and gracefully
    ///      terminates all tasks.
    pub async fn run(self) -> Result<()> {
        let self_id = NodeId::new(self.config.self_id.clone());

        tracing::info!(
            %self_id,
            bind_addr = %self.config.bind_addr,
            "starting membership node"
        );

        let (handle, receiver) = ServiceShellHandle::new_channel(256);

        let addresses = AddressBook::new();
        for peer in &self.config.bootstrap_peers {
            addresses.set(NodeId::new(peer.node_id.clone()), peer.addr);
        }
        let transport = Arc::new(QuicTransport::new(
            self.config.bind_addr,
            addresses,
            Arc::new(handle.clone()),
        )?);
        let transport_task = tokio::spawn({
            let transport = transport.clone();
            let shutdown = self.shutdown_token.clone();
            async move { transport.run(shutdown).await }
        });
        tracing::debug!("QUIC transport spawned");

        let store = StateStore::new(self.config.data_dir.clone());
        let events = EventBus::default();

        let service_task = ServiceShell::spawn(
            receiver,
            self_id,
            store,
            events,
            transport,
            self.config.test,
            Duration::from_millis(self.config.rpc_timeout_ms),
            Duration::from_millis(self.config.states_timeout_ms),
            Duration::from_millis(self.config.rejoin_timeout_ms),
            self.shutdown_token.clone(),
        );
        tracing::debug!("service shell spawned");

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received, initiating graceful shutdown");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "transport task failed");
        }
        if let Err(e) = service_task.await {
            tracing::error!(error = ?e, "service shell task failed");
        }
        tracing::info!("node has shut down gracefully");

        Ok(())
    }
}
