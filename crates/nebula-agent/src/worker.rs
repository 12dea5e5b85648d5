//! Periodic agent work: heartbeats, conn-break notice, snapshots.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, info};

use nebula_core::Result;
use nebula_core::protocol::{ConnBreak, Frame, MetricsReport};

use crate::config::AgentConfig;
use crate::endpoint::EndpointProvider;
use crate::metrics::MetricsSampler;
use crate::session::Session;
use crate::snapshot::scan_shared_folder;

/// Builds and sends the recurring agent frames over a session.
pub struct AgentWorker {
    session: Arc<Session>,
    config: Arc<AgentConfig>,
    sampler: Arc<dyn MetricsSampler>,
    endpoint: Arc<dyn EndpointProvider>,
}

impl AgentWorker {
    pub fn new(
        session: Arc<Session>,
        config: Arc<AgentConfig>,
        sampler: Arc<dyn MetricsSampler>,
        endpoint: Arc<dyn EndpointProvider>,
    ) -> Self {
        Self {
            session,
            config,
            sampler,
            endpoint,
        }
    }

    /// Assemble a metrics frame from a fresh sample.
    pub fn metrics_frame(&self) -> Frame {
        let identity = self.session.identity();
        Frame::AgentMetrics(MetricsReport {
            agent_id: identity.id.clone(),
            agent_name: identity.name.clone(),
            host_metrics: self.sampler.sample(),
            public_endpoint: self.endpoint.public_endpoint(),
            timestamp: unix_now(),
        })
    }

    /// Send one heartbeat.
    pub fn send_heartbeat(&self) -> Result<()> {
        self.session.send(self.metrics_frame())
    }

    /// Best-effort notice that this agent is about to disconnect.
    pub fn send_conn_break(&self) {
        let frame = Frame::AgentConnBreak(ConnBreak {
            agent_id: self.session.agent_id().to_string(),
            timestamp: unix_now(),
        });
        if let Err(e) = self.session.send(frame) {
            debug!(error = %e, "Conn-break notice not sent");
        }
    }

    /// Scan the shared folder and send a directory snapshot.
    pub async fn send_directory_snapshot(&self) -> Result<()> {
        let agent_id = self.session.agent_id().to_string();
        let shared = self.config.shared_folder().clone();
        let snapshot =
            tokio::task::spawn_blocking(move || scan_shared_folder(&agent_id, &shared))
                .await
                .map_err(|e| nebula_core::Error::Session {
                    message: format!("snapshot task panicked: {}", e),
                })??;
        let total = snapshot.directory.total_files;
        self.session.send(Frame::AgentDirectorySnapshot(snapshot))?;
        info!(files = total, "Directory snapshot sent");
        Ok(())
    }

    /// Heartbeat loop; exits when the session dies.
    pub async fn run_heartbeat(&self) {
        let cancel = self.session.cancel_token();
        let mut ticker = tokio::time::interval(self.config.heartbeat_timer());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopping heartbeat: session closed");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat() {
                        error!(error = %e, "Failed to send heartbeat");
                    }
                }
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nebula_core::AgentIdentity;
    use nebula_core::protocol::{HostMetrics, Outbound};
    use nebula_test_utils::FixedSampler;

    use crate::endpoint::EnvEndpointProvider;

    use super::*;

    impl MetricsSampler for FixedSampler {
        fn sample(&self) -> HostMetrics {
            self.sample_fixed()
        }
    }

    fn worker_with_session() -> (AgentWorker, tokio::sync::mpsc::Receiver<Outbound>) {
        let (session, outbound_rx, _tx) =
            Session::detached(AgentIdentity::from_parts("agent-1", "one", "Linux"));
        let config = Arc::new(AgentConfig::for_tests("http://m", PathBuf::from("/tmp/s")));
        let worker = AgentWorker::new(
            session,
            config,
            Arc::new(FixedSampler::default()),
            Arc::new(EnvEndpointProvider::fixed("203.0.113.5:41000")),
        );
        (worker, outbound_rx)
    }

    #[tokio::test]
    async fn heartbeat_carries_identity_and_endpoint() {
        let (worker, mut outbound_rx) = worker_with_session();
        worker.send_heartbeat().unwrap();

        match outbound_rx.recv().await.unwrap() {
            Outbound::Frame(Frame::AgentMetrics(report)) => {
                assert_eq!(report.agent_id, "agent-1");
                assert_eq!(report.agent_name, "one");
                assert_eq!(report.public_endpoint.as_deref(), Some("203.0.113.5:41000"));
                assert!(report.timestamp > 0);
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }

    #[tokio::test]
    async fn conn_break_carries_agent_id() {
        let (worker, mut outbound_rx) = worker_with_session();
        worker.send_conn_break();
        match outbound_rx.recv().await.unwrap() {
            Outbound::Frame(Frame::AgentConnBreak(notice)) => {
                assert_eq!(notice.agent_id, "agent-1");
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }
}
