//! Typed handler registration for master frames.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use nebula_core::protocol::{FallbackAction, Frame, FrameKind, TransferMode, TransferStatus};

use crate::service::ServiceController;
use crate::session::Session;
use crate::transfer::TransferManager;
use crate::worker::AgentWorker;

/// Everything the handlers need, wired once per session.
pub struct HandlerDeps {
    pub transfer: Arc<TransferManager>,
    pub worker: Arc<AgentWorker>,
    pub controller: Arc<dyn ServiceController>,
}

/// Install one handler per master frame kind on the session.
pub fn register_all(session: &Arc<Session>, deps: HandlerDeps) {
    let HandlerDeps {
        transfer,
        worker,
        controller,
    } = deps;

    // Fresh metrics on demand.
    {
        let worker = Arc::clone(&worker);
        session.register_handler(
            FrameKind::MasterMetricsRequest,
            Box::new(move |_| worker.send_heartbeat()),
        );
    }

    // Lifecycle commands delegate to the service controller.
    {
        let controller = Arc::clone(&controller);
        session.register_handler(
            FrameKind::MasterRestartRequest,
            Box::new(move |_| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    if let Err(e) = controller.restart().await {
                        error!(error = %e, "Restart request failed");
                    }
                });
                Ok(())
            }),
        );
    }
    {
        let controller = Arc::clone(&controller);
        session.register_handler(
            FrameKind::MasterUninstallInitiated,
            Box::new(move |_| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    if let Err(e) = controller.uninstall().await {
                        error!(error = %e, "Uninstall request failed");
                    }
                });
                Ok(())
            }),
        );
    }

    session.register_handler(
        FrameKind::MasterTransferIntent,
        Box::new(|frame| {
            if let Frame::MasterTransferIntent(intent) = frame {
                info!(
                    requesting = %intent.requesting_agent_id,
                    source = %intent.source_agent_id,
                    path = %intent.path,
                    connection_id = intent.connection_id.as_deref().unwrap_or("-"),
                    "Transfer intent"
                );
            }
            Ok(())
        }),
    );

    // Rendezvous attempt.
    {
        let transfer = Arc::clone(&transfer);
        session.register_handler(
            FrameKind::MasterP2pInitiate,
            Box::new(move |frame| {
                if let Frame::MasterP2pInitiate(init) = frame {
                    let transfer = Arc::clone(&transfer);
                    tokio::spawn(async move {
                        transfer.attempt_p2p(init).await;
                    });
                }
                Ok(())
            }),
        );
    }

    // Send triggers (direct and relay).
    {
        let transfer = Arc::clone(&transfer);
        session.register_handler(
            FrameKind::MasterP2pTransferStart,
            Box::new(move |frame| {
                if let Frame::MasterP2pTransferStart(start) = frame {
                    let transfer = Arc::clone(&transfer);
                    tokio::spawn(async move {
                        let _ = transfer
                            .send(
                                &start.path,
                                &start.requesting_agent_id,
                                TransferMode::P2p,
                                Some(start.connection_id),
                            )
                            .await;
                    });
                }
                Ok(())
            }),
        );
    }
    {
        let transfer = Arc::clone(&transfer);
        session.register_handler(
            FrameKind::MasterRelayTransferStart,
            Box::new(move |frame| {
                if let Frame::MasterRelayTransferStart(start) = frame {
                    let transfer = Arc::clone(&transfer);
                    tokio::spawn(async move {
                        let _ = transfer
                            .send(
                                &start.path,
                                &start.requesting_agent_id,
                                TransferMode::Relay,
                                Some(start.connection_id),
                            )
                            .await;
                    });
                }
                Ok(())
            }),
        );
    }

    // Relay fallback assigns each side its role.
    {
        let transfer = Arc::clone(&transfer);
        session.register_handler(
            FrameKind::MasterRelayFallback,
            Box::new(move |frame| {
                if let Frame::MasterRelayFallback(fallback) = frame {
                    let transfer = Arc::clone(&transfer);
                    tokio::spawn(async move {
                        // Either role abandons any half-open direct link.
                        transfer.close_link(&fallback.connection_id).await;
                        match fallback.action {
                            FallbackAction::Send => {
                                info!(
                                    connection_id = %fallback.connection_id,
                                    "Relay fallback: sending over control session"
                                );
                                // The matching relay_transfer_start carries
                                // the path and starts the stream.
                            }
                            FallbackAction::Receive => {
                                if let Err(e) = transfer
                                    .receive(&fallback.source_agent_id, TransferMode::Relay)
                                    .await
                                {
                                    error!(error = %e, "Relay fallback receive failed");
                                }
                            }
                        }
                    });
                }
                Ok(())
            }),
        );
    }

    // Forwarded status frames drive the receive lifecycle.
    {
        let transfer = Arc::clone(&transfer);
        let worker = Arc::clone(&worker);
        session.register_handler(
            FrameKind::MasterTransferStatus,
            Box::new(move |frame| {
                let Frame::MasterTransferStatus(update) = frame else {
                    return Ok(());
                };
                match update.status {
                    TransferStatus::Initiated => {
                        let Some(source) = update.agent_id.clone() else {
                            warn!("Initiated status without source agent id");
                            return Ok(());
                        };
                        let transfer = Arc::clone(&transfer);
                        tokio::spawn(async move {
                            let mode = if transfer.has_direct_link_to(&source).await {
                                TransferMode::P2p
                            } else {
                                TransferMode::Relay
                            };
                            if let Err(e) = transfer.receive(&source, mode).await {
                                error!(error = %e, source = %source, "Failed to start receiving");
                            }
                        });
                    }
                    TransferStatus::Running => {
                        debug!(source = update.agent_id.as_deref().unwrap_or("-"), "Transfer running");
                    }
                    TransferStatus::Completed => {
                        let transfer = Arc::clone(&transfer);
                        let worker = Arc::clone(&worker);
                        tokio::spawn(async move {
                            match transfer.complete().await {
                                Ok(()) => {
                                    // Surface the new files to the master.
                                    if let Err(e) = worker.send_directory_snapshot().await {
                                        warn!(error = %e, "Post-transfer snapshot failed");
                                    }
                                }
                                Err(e) => error!(error = %e, "Failed to complete transfer"),
                            }
                        });
                    }
                    TransferStatus::TransferFailed => {
                        let transfer = Arc::clone(&transfer);
                        let reason = update.reason.clone();
                        tokio::spawn(async move {
                            transfer.abort(reason).await;
                        });
                    }
                    TransferStatus::P2pSuccess | TransferStatus::P2pFailed => {
                        debug!(status = ?update.status, "Ignoring rendezvous status from master");
                    }
                }
                Ok(())
            }),
        );
    }
}
