//! Master-side transfer coordination.
//!
//! A transfer request first tries the peer rendezvous (when both agents
//! have a reported public endpoint) and falls back to relaying chunks
//! through the master. Both coordinators talk to the hub through two
//! narrow traits so the state machines are testable with fakes.

mod p2p;
mod relay;

pub use p2p::{P2pCoordinator, RendezvousConfirmed, RendezvousFailed, TransferState};
pub use relay::RelayCoordinator;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use nebula_core::protocol::{Frame, Outbound, TransferIntent};
use nebula_core::{Error, Result};

/// Sends a frame (or chunk) to an agent's session, best-effort.
pub trait FrameSender: Send + Sync {
    fn send_to(&self, agent_id: &str, out: Outbound);
}

/// The slice of per-connection state the coordinators need.
pub trait ConnectionDirectory: Send + Sync {
    fn is_connected(&self, agent_id: &str) -> bool;
    fn public_endpoint(&self, agent_id: &str) -> Option<String>;
    fn set_relay_to(&self, agent_id: &str, target: Option<String>);
    fn relay_to(&self, agent_id: &str) -> Option<String>;
}

/// Front door for transfer requests plus the confirmed/failed event loops.
pub struct TransferManager {
    sender: Arc<dyn FrameSender>,
    dir: Arc<dyn ConnectionDirectory>,
    p2p: Arc<P2pCoordinator>,
    relay: RelayCoordinator,
}

impl TransferManager {
    pub fn new(sender: Arc<dyn FrameSender>, dir: Arc<dyn ConnectionDirectory>) -> Arc<Self> {
        let (confirmed_tx, confirmed_rx) = mpsc::channel(16);
        let (failed_tx, failed_rx) = mpsc::channel(16);

        let manager = Arc::new(Self {
            p2p: P2pCoordinator::new(
                Arc::clone(&sender),
                Arc::clone(&dir),
                confirmed_tx,
                failed_tx,
            ),
            relay: RelayCoordinator::new(Arc::clone(&sender), Arc::clone(&dir)),
            sender,
            dir,
        });

        manager.clone().spawn_confirmed_loop(confirmed_rx);
        manager.clone().spawn_failed_loop(failed_rx);
        manager
    }

    /// The rendezvous coordinator (status router feeds it).
    pub fn p2p(&self) -> &P2pCoordinator {
        &self.p2p
    }

    /// Handle a transfer request from the API surface.
    ///
    /// Validates preconditions synchronously and returns the minted
    /// `connection_id`; the transfer itself proceeds asynchronously.
    pub fn request_transfer(
        &self,
        requesting_agent_id: &str,
        source_agent_id: &str,
        path: &str,
    ) -> Result<String> {
        if requesting_agent_id == source_agent_id {
            return Err(Error::transfer("source and destination are the same agent"));
        }
        for agent in [requesting_agent_id, source_agent_id] {
            if !self.dir.is_connected(agent) {
                return Err(Error::AgentOffline(agent.to_string()));
            }
        }
        if path.is_empty() {
            return Err(Error::transfer("path is required"));
        }

        let both_endpoints = self.dir.public_endpoint(requesting_agent_id).is_some()
            && self.dir.public_endpoint(source_agent_id).is_some();

        let connection_id = if both_endpoints {
            self.p2p
                .start(requesting_agent_id, source_agent_id, path)?
        } else {
            info!(
                requesting = %requesting_agent_id,
                source = %source_agent_id,
                "Endpoints unavailable, going straight to relay"
            );
            let connection_id = uuid::Uuid::new_v4().to_string();
            self.relay.initiate(
                requesting_agent_id,
                source_agent_id,
                path,
                &connection_id,
            )?;
            connection_id
        };

        // Both parties get a heads-up with the minted id.
        let intent = TransferIntent {
            requesting_agent_id: requesting_agent_id.to_string(),
            source_agent_id: source_agent_id.to_string(),
            path: path.to_string(),
            connection_id: Some(connection_id.clone()),
        };
        self.sender.send_to(
            requesting_agent_id,
            Frame::MasterTransferIntent(intent.clone()).into(),
        );
        self.sender
            .send_to(source_agent_id, Frame::MasterTransferIntent(intent).into());

        info!(
            connection_id = %connection_id,
            requesting = %requesting_agent_id,
            source = %source_agent_id,
            path = %path,
            p2p = both_endpoints,
            "Transfer request accepted"
        );
        Ok(connection_id)
    }

    /// A terminal status arrived from `reporter`: drop rendezvous state
    /// and unhook the relay path.
    pub fn handle_terminal(&self, connection_id: Option<&str>, reporter_agent_id: &str) {
        if let Some(connection_id) = connection_id {
            self.p2p.remove(connection_id);
        }
        self.dir.set_relay_to(reporter_agent_id, None);
    }

    fn spawn_confirmed_loop(self: Arc<Self>, mut rx: mpsc::Receiver<RendezvousConfirmed>) {
        tokio::spawn(async move {
            while let Some(confirmed) = rx.recv().await {
                self.on_confirmed(confirmed);
            }
        });
    }

    fn spawn_failed_loop(self: Arc<Self>, mut rx: mpsc::Receiver<RendezvousFailed>) {
        tokio::spawn(async move {
            while let Some(failed) = rx.recv().await {
                self.on_failed(failed);
            }
        });
    }

    fn on_confirmed(&self, confirmed: RendezvousConfirmed) {
        info!(
            connection_id = %confirmed.connection_id,
            source = %confirmed.source,
            requesting = %confirmed.requesting,
            "Rendezvous confirmed, starting direct transfer"
        );
        // Status passthrough to the requester rides the relay_to binding
        // in both modes.
        self.dir
            .set_relay_to(&confirmed.source, Some(confirmed.requesting.clone()));
        self.sender.send_to(
            &confirmed.source,
            Frame::MasterP2pTransferStart(nebula_core::protocol::TransferStart {
                requesting_agent_id: confirmed.requesting,
                path: confirmed.path,
                connection_id: confirmed.connection_id,
                transfer_mode: nebula_core::protocol::TransferMode::P2p,
            })
            .into(),
        );
    }

    fn on_failed(&self, failed: RendezvousFailed) {
        warn!(
            connection_id = %failed.connection_id,
            reason = %failed.reason,
            "Rendezvous failed, falling back to relay"
        );
        if let Err(e) = self.relay.initiate_fallback(
            &failed.requesting,
            &failed.source,
            &failed.path,
            &failed.connection_id,
        ) {
            error!(
                connection_id = %failed.connection_id,
                error = %e,
                "Relay fallback failed"
            );
            // Surface the dead end to the requester.
            self.sender.send_to(
                &failed.requesting,
                Frame::MasterTransferStatus(
                    nebula_core::protocol::TransferStatusUpdate::report(
                        nebula_core::protocol::TransferStatus::TransferFailed,
                        failed.source.clone(),
                    )
                    .with_connection_id(&failed.connection_id)
                    .with_reason(e.to_string()),
                )
                .into(),
            );
        }
        // State deleted only after the fallback was initiated.
        self.p2p.remove(&failed.connection_id);
    }
}
