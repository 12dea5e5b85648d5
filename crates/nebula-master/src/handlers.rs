//! Hub handlers for agent-originated frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::oneshot;
use tracing::{debug, info};

use nebula_core::protocol::{Frame, FrameKind, MetricsReport};

use crate::hub::Hub;

/// REST waiters for on-demand metrics, keyed by agent id.
pub type PendingMetrics = Arc<StdMutex<HashMap<String, oneshot::Sender<MetricsReport>>>>;

/// Install handlers for the agent-originated frame kinds.
///
/// The transfer status handler is registered separately by
/// [`crate::status::register`].
pub fn register(hub: &Arc<Hub>, pending: PendingMetrics) {
    // agent_metrics: refresh the registration and resolve REST waiters.
    {
        let pending = Arc::clone(&pending);
        hub.register_handler(
            FrameKind::AgentMetrics,
            Arc::new(move |frame, conn| {
                let Frame::AgentMetrics(report) = frame else {
                    return Ok(());
                };
                if report.public_endpoint.is_some() {
                    conn.set_public_endpoint(report.public_endpoint.clone());
                }
                conn.set_last_metrics(report.clone());
                conn.touch();

                let waiter = pending
                    .lock()
                    .expect("pending metrics poisoned")
                    .remove(&conn.id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(report);
                }
                Ok(())
            }),
        );
    }

    // agent_conn_break: the socket teardown does the bookkeeping; this is
    // just the polite version of the event.
    hub.register_handler(
        FrameKind::AgentConnBreak,
        Arc::new(|frame, conn| {
            if let Frame::AgentConnBreak(notice) = frame {
                info!(agent_id = %conn.id, timestamp = notice.timestamp, "Agent announced disconnect");
            }
            Ok(())
        }),
    );

    // agent_directory_snapshot: broadcast happens in the processor; the
    // master itself keeps no listing state.
    hub.register_handler(
        FrameKind::AgentDirectorySnapshot,
        Arc::new(|frame, conn| {
            if let Frame::AgentDirectorySnapshot(snapshot) = frame {
                debug!(
                    agent_id = %conn.id,
                    files = snapshot.directory.total_files,
                    bytes = snapshot.directory.total_size,
                    "Directory snapshot"
                );
            }
            Ok(())
        }),
    );
}

// =============================================================================
// Tests
// =============================================================================
