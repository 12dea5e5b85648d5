//! Connection supervisor: dial, run, tear down, redial.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nebula_core::AgentIdentity;
use nebula_core::constants::RECONNECT_BACKOFF;

use crate::config::AgentConfig;
use crate::endpoint::EndpointProvider;
use crate::handlers::{self, HandlerDeps};
use crate::metrics::MetricsSampler;
use crate::service::ServiceController;
use crate::session::Session;
use crate::transfer::TransferManager;
use crate::worker::AgentWorker;

/// Long-lived collaborators shared across reconnects.
pub struct Supervisor {
    config: Arc<AgentConfig>,
    identity: AgentIdentity,
    sampler: Arc<dyn MetricsSampler>,
    endpoint: Arc<dyn EndpointProvider>,
    controller: Arc<dyn ServiceController>,
}

impl Supervisor {
    pub fn new(
        config: Arc<AgentConfig>,
        identity: AgentIdentity,
        sampler: Arc<dyn MetricsSampler>,
        endpoint: Arc<dyn EndpointProvider>,
        controller: Arc<dyn ServiceController>,
    ) -> Self {
        Self {
            config,
            identity,
            sampler,
            endpoint,
            controller,
        }
    }

    /// Reconnect loop: runs until `shutdown` is cancelled.
    ///
    /// Each cycle opens a session, wires handlers and the heartbeat, then
    /// waits for disconnect. Transfer state never survives a session: it
    /// is torn down before the backoff sleep.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let session =
                match Session::connect(&self.config, self.identity.clone(), &shutdown).await {
                    Ok(session) => session,
                    Err(e) => {
                        error!(error = %e, "Failed to connect to master");
                        if sleep_or_shutdown(&shutdown).await {
                            return;
                        }
                        continue;
                    }
                };

            let worker = Arc::new(AgentWorker::new(
                Arc::clone(&session),
                Arc::clone(&self.config),
                Arc::clone(&self.sampler),
                Arc::clone(&self.endpoint),
            ));
            let transfer = TransferManager::new(Arc::clone(&session), Arc::clone(&self.config));

            handlers::register_all(
                &session,
                HandlerDeps {
                    transfer: Arc::clone(&transfer),
                    worker: Arc::clone(&worker),
                    controller: Arc::clone(&self.controller),
                },
            );

            // The heartbeat interval fires immediately, then on the timer.
            let heartbeat_worker = Arc::clone(&worker);
            tokio::spawn(async move { heartbeat_worker.run_heartbeat().await });

            // Initial shared-folder snapshot, slightly delayed so the
            // master has registered the connection.
            let snapshot_worker = Arc::clone(&worker);
            let snapshot_cancel = session.cancel_token();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if !snapshot_cancel.is_cancelled() {
                    if let Err(e) = snapshot_worker.send_directory_snapshot().await {
                        error!(error = %e, "Initial directory snapshot failed");
                    }
                }
            });

            tokio::select! {
                _ = session.disconnected() => {
                    info!("Session lost, cleaning up");
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing session");
                    worker.send_conn_break();
                    // Give the writer a moment to flush the notice.
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    transfer.teardown().await;
                    session.close();
                    return;
                }
            }

            transfer.teardown().await;
            session.close();

            if sleep_or_shutdown(&shutdown).await {
                return;
            }
        }
    }
}

/// Sleep the fixed backoff; returns true when shutdown arrived instead.
async fn sleep_or_shutdown(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => false,
    }
}
