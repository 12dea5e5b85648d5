//! Relay transfer wiring.
//!
//! The relay path has no state machine of its own: once `relay_to` is set
//! on the source's session, the hub's stream-forwarder moves every binary
//! chunk to the requester, and the status router forwards status frames.

use std::sync::Arc;

use tracing::info;

use nebula_core::protocol::{
    FallbackAction, Frame, RelayFallback, TransferMode, TransferStart,
};
use nebula_core::{Error, Result};

use super::{ConnectionDirectory, FrameSender};

pub struct RelayCoordinator {
    sender: Arc<dyn FrameSender>,
    dir: Arc<dyn ConnectionDirectory>,
}

impl RelayCoordinator {
    pub fn new(sender: Arc<dyn FrameSender>, dir: Arc<dyn ConnectionDirectory>) -> Self {
        Self { sender, dir }
    }

    /// Wire the relay path and tell the source to start streaming.
    pub fn initiate(
        &self,
        requesting: &str,
        source: &str,
        path: &str,
        connection_id: &str,
    ) -> Result<()> {
        for agent in [requesting, source] {
            if !self.dir.is_connected(agent) {
                return Err(Error::AgentOffline(agent.to_string()));
            }
        }

        self.dir.set_relay_to(source, Some(requesting.to_string()));
        self.sender.send_to(
            source,
            Frame::MasterRelayTransferStart(TransferStart {
                requesting_agent_id: requesting.to_string(),
                path: path.to_string(),
                connection_id: connection_id.to_string(),
                transfer_mode: TransferMode::Relay,
            })
            .into(),
        );
        info!(
            connection_id = %connection_id,
            source = %source,
            requesting = %requesting,
            "Relay transfer started"
        );
        Ok(())
    }

    /// Relay after a failed rendezvous: wire the path, then assign each
    /// side its role so half-open direct links get abandoned.
    pub fn initiate_fallback(
        &self,
        requesting: &str,
        source: &str,
        path: &str,
        connection_id: &str,
    ) -> Result<()> {
        self.initiate(requesting, source, path, connection_id)?;

        let fallback = |action: FallbackAction| {
            Frame::MasterRelayFallback(RelayFallback {
                connection_id: connection_id.to_string(),
                requesting_agent_id: requesting.to_string(),
                source_agent_id: source.to_string(),
                transfer_mode: TransferMode::Relay,
                fallback: true,
                action,
            })
        };
        self.sender
            .send_to(source, fallback(FallbackAction::Send).into());
        self.sender
            .send_to(requesting, fallback(FallbackAction::Receive).into());
        info!(
            connection_id = %connection_id,
            "Relay fallback roles assigned"
        );
        Ok(())
    }
}
