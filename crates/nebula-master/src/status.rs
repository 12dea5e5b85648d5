//! Status router: agent status frames → coordinator events + forwarding.
//!
//! Routing is a pure decision function over the incoming update, so the
//! table in the decision can be tested without sockets; the registered
//! hub handler just applies the decision.

use std::sync::Arc;

use tracing::debug;

use nebula_core::protocol::{Frame, FrameKind, TransferStatus, TransferStatusUpdate};

use crate::hub::Hub;
use crate::transfer::TransferManager;

/// What the router decided to do with one status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedStatus {
    pub action: Option<CoordinatorAction>,
    /// Forward a rewritten copy to the reporter's `relay_to` target.
    pub forward: bool,
    /// Terminal statuses clear state after forwarding.
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorAction {
    ConfirmSuccess { connection_id: String },
    ReportFailure { connection_id: String, reason: String },
    BindRelay { connection_id: String },
}

/// Decide how to treat `update` reported by `reporter`.
pub fn route_status(update: &TransferStatusUpdate) -> RoutedStatus {
    match update.status {
        TransferStatus::P2pSuccess => RoutedStatus {
            action: update
                .connection_id
                .clone()
                .map(|connection_id| CoordinatorAction::ConfirmSuccess { connection_id }),
            forward: false,
            terminal: false,
        },
        TransferStatus::P2pFailed => RoutedStatus {
            action: update.connection_id.clone().map(|connection_id| {
                CoordinatorAction::ReportFailure {
                    connection_id,
                    reason: update
                        .reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                }
            }),
            forward: false,
            terminal: false,
        },
        TransferStatus::Initiated => RoutedStatus {
            action: update
                .connection_id
                .clone()
                .map(|connection_id| CoordinatorAction::BindRelay { connection_id }),
            forward: true,
            terminal: false,
        },
        TransferStatus::Running => RoutedStatus {
            action: None,
            forward: true,
            terminal: false,
        },
        TransferStatus::Completed | TransferStatus::TransferFailed => RoutedStatus {
            action: None,
            forward: true,
            terminal: true,
        },
    }
}

/// Rewrite a status for the requester: the `agent_id` becomes the source
/// (the reporter), and only status, id and reason survive.
pub fn rewrite_for_requester(
    update: &TransferStatusUpdate,
    reporter_agent_id: &str,
) -> TransferStatusUpdate {
    TransferStatusUpdate {
        status: update.status,
        connection_id: update.connection_id.clone(),
        agent_id: Some(reporter_agent_id.to_string()),
        reason: update.reason.clone(),
    }
}

/// Install the `master_transfer_status` handler on the hub.
pub fn register(hub: &Arc<Hub>, manager: Arc<TransferManager>) {
    let router_hub = Arc::clone(hub);
    hub.register_handler(
        FrameKind::MasterTransferStatus,
        Arc::new(move |frame, conn| {
            let Frame::MasterTransferStatus(update) = frame else {
                return Ok(());
            };
            let decision = route_status(&update);

            match decision.action {
                Some(CoordinatorAction::ConfirmSuccess { connection_id }) => {
                    manager.p2p().handle_success(&connection_id, &conn.id);
                }
                Some(CoordinatorAction::ReportFailure {
                    connection_id,
                    reason,
                }) => {
                    manager.p2p().handle_failure(&connection_id, &reason);
                }
                Some(CoordinatorAction::BindRelay { connection_id }) => {
                    // A source announcing `initiated` for a known transfer
                    // wires status passthrough if nothing has yet.
                    if router_hub.relay_to(&conn.id).is_none() {
                        if let Some(state) = manager.p2p().get(&connection_id) {
                            router_hub
                                .set_relay_to(&conn.id, Some(state.requesting().to_string()));
                        }
                    }
                }
                None => {}
            }

            // Forward after any binding so a fresh `initiated` reaches the
            // requester too.
            if decision.forward {
                if let Some(target) = router_hub.relay_to(&conn.id) {
                    debug!(
                        status = ?update.status,
                        source = %conn.id,
                        target = %target,
                        "Forwarding status to requester"
                    );
                    router_hub.send_frame(
                        &target,
                        Frame::MasterTransferStatus(rewrite_for_requester(&update, &conn.id)),
                    );
                }
            }

            if decision.terminal {
                manager.handle_terminal(update.connection_id.as_deref(), &conn.id);
            }
            Ok(())
        }),
    );
}

// =============================================================================
// Tests
// =============================================================================
