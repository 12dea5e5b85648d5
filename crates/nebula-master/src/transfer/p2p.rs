//! Peer rendezvous state machine.
//!
//! One driver task per `connection_id` walks a bounded retry loop: tell
//! both agents to dial each other, wait for both to confirm, back off and
//! retry on failure or timeout, and hand the transfer to the relay path
//! once retries are exhausted. State survives a confirmed rendezvous
//! until the transfer reports a terminal status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nebula_core::constants::{
    P2P_CONNECTION_TIMEOUT, P2P_COUNTDOWN_SECONDS, P2P_INITIAL_BACKOFF, P2P_MAX_RETRIES,
};
use nebula_core::protocol::{Frame, P2pInitiate};
use nebula_core::{Error, Result};

use super::{ConnectionDirectory, FrameSender};

/// Fired once when both agents confirm a dial attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfirmed {
    pub connection_id: String,
    pub requesting: String,
    pub source: String,
    pub path: String,
}

/// Fired once when every attempt has failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousFailed {
    pub connection_id: String,
    pub requesting: String,
    pub source: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RendezvousStatus {
    Attempting,
    Connected,
    Failed,
}

#[derive(Debug)]
struct StateInner {
    attempt_number: u32,
    retry_count: u32,
    status: RendezvousStatus,
    requesting_confirmed: bool,
    source_confirmed: bool,
    confirmed_fired: bool,
}

/// Per-`connection_id` rendezvous state.
pub struct TransferState {
    connection_id: String,
    requesting: String,
    source: String,
    path: String,
    inner: StdMutex<StateInner>,
    success_tx: mpsc::Sender<()>,
    failure_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl TransferState {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn requesting(&self) -> &str {
        &self.requesting
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Attempt currently (or last) in flight, 1-based.
    pub fn attempt_number(&self) -> u32 {
        self.lock().attempt_number
    }

    /// Failed attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// Whether both sides have confirmed.
    pub fn is_connected(&self) -> bool {
        self.lock().status == RendezvousStatus::Connected
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().expect("rendezvous state poisoned")
    }
}

/// Drives all active rendezvous.
pub struct P2pCoordinator {
    active: StdMutex<HashMap<String, Arc<TransferState>>>,
    sender: Arc<dyn FrameSender>,
    dir: Arc<dyn ConnectionDirectory>,
    confirmed_tx: mpsc::Sender<RendezvousConfirmed>,
    failed_tx: mpsc::Sender<RendezvousFailed>,
}

impl P2pCoordinator {
    pub fn new(
        sender: Arc<dyn FrameSender>,
        dir: Arc<dyn ConnectionDirectory>,
        confirmed_tx: mpsc::Sender<RendezvousConfirmed>,
        failed_tx: mpsc::Sender<RendezvousFailed>,
    ) -> Arc<Self> {
        Arc::new(Self {
            active: StdMutex::new(HashMap::new()),
            sender,
            dir,
            confirmed_tx,
            failed_tx,
        })
    }

    /// Mint a `connection_id` and start the retry driver.
    ///
    /// Errors when either side has no reported endpoint; the caller falls
    /// back to relay without any attempt.
    pub fn start(
        self: &Arc<Self>,
        requesting: &str,
        source: &str,
        path: &str,
    ) -> Result<String> {
        let requesting_endpoint =
            self.dir
                .public_endpoint(requesting)
                .ok_or_else(|| Error::Transfer {
                    message: format!("agent {} has no public endpoint", requesting),
                })?;
        let source_endpoint = self
            .dir
            .public_endpoint(source)
            .ok_or_else(|| Error::Transfer {
                message: format!("agent {} has no public endpoint", source),
            })?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        let (success_tx, success_rx) = mpsc::channel(1);
        let (failure_tx, failure_rx) = mpsc::channel(4);
        let state = Arc::new(TransferState {
            connection_id: connection_id.clone(),
            requesting: requesting.to_string(),
            source: source.to_string(),
            path: path.to_string(),
            inner: StdMutex::new(StateInner {
                attempt_number: 0,
                retry_count: 0,
                status: RendezvousStatus::Attempting,
                requesting_confirmed: false,
                source_confirmed: false,
                confirmed_fired: false,
            }),
            success_tx,
            failure_tx,
            cancel: CancellationToken::new(),
        });

        self.active
            .lock()
            .expect("active map poisoned")
            .insert(connection_id.clone(), Arc::clone(&state));

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator
                .drive(state, requesting_endpoint, source_endpoint, success_rx, failure_rx)
                .await;
        });

        info!(
            connection_id = %connection_id,
            requesting = %requesting,
            source = %source,
            "Rendezvous started"
        );
        Ok(connection_id)
    }

    /// An agent reported `p2p_success`.
    ///
    /// The confirmation is a per-agent flag; the confirmed event fires
    /// exactly once when both flags are set, however the reports are
    /// ordered or duplicated.
    pub fn handle_success(&self, connection_id: &str, agent_id: &str) {
        let Some(state) = self.get(connection_id) else {
            info!(
                connection_id = %connection_id,
                agent = %agent_id,
                "Success report for unknown rendezvous, dropping"
            );
            return;
        };

        let fire = {
            let mut inner = state.lock();
            if agent_id == state.requesting {
                inner.requesting_confirmed = true;
            } else if agent_id == state.source {
                inner.source_confirmed = true;
            } else {
                warn!(
                    connection_id = %connection_id,
                    agent = %agent_id,
                    "Success report from an agent outside this rendezvous"
                );
                return;
            }
            let both = inner.requesting_confirmed && inner.source_confirmed;
            if both && !inner.confirmed_fired {
                inner.confirmed_fired = true;
                true
            } else {
                debug!(
                    connection_id = %connection_id,
                    requesting = inner.requesting_confirmed,
                    source = inner.source_confirmed,
                    "Confirmation recorded"
                );
                false
            }
        };

        if fire {
            let _ = state.success_tx.try_send(());
        }
    }

    /// An agent reported `p2p_failed` for the current attempt.
    pub fn handle_failure(&self, connection_id: &str, reason: &str) {
        let Some(state) = self.get(connection_id) else {
            info!(
                connection_id = %connection_id,
                "Failure report for unknown rendezvous, dropping"
            );
            return;
        };
        // First terminal report wins; a full channel means this attempt
        // already has its verdict.
        let _ = state.failure_tx.try_send(reason.to_string());
    }

    /// Look up live state.
    pub fn get(&self, connection_id: &str) -> Option<Arc<TransferState>> {
        self.active
            .lock()
            .expect("active map poisoned")
            .get(connection_id)
            .cloned()
    }

    /// Drop state and stop its driver.
    pub fn remove(&self, connection_id: &str) {
        let removed = self
            .active
            .lock()
            .expect("active map poisoned")
            .remove(connection_id);
        if let Some(state) = removed {
            state.cancel.cancel();
            debug!(connection_id = %connection_id, "Rendezvous state removed");
        }
    }

    /// Number of live rendezvous (tests and introspection).
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active map poisoned").len()
    }

    async fn drive(
        &self,
        state: Arc<TransferState>,
        requesting_endpoint: String,
        source_endpoint: String,
        mut success_rx: mpsc::Receiver<()>,
        mut failure_rx: mpsc::Receiver<String>,
    ) {
        for attempt in 1..=P2P_MAX_RETRIES {
            {
                let mut inner = state.lock();
                inner.attempt_number = attempt;
                // A fresh attempt starts with clean confirmations.
                inner.requesting_confirmed = false;
                inner.source_confirmed = false;
            }
            self.send_initiations(&state, &requesting_endpoint, &source_endpoint, attempt);

            let confirmed = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return,
                Some(()) = success_rx.recv() => true,
                reason = failure_rx.recv() => {
                    warn!(
                        connection_id = %state.connection_id,
                        attempt,
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "Rendezvous attempt failed"
                    );
                    false
                }
                _ = tokio::time::sleep(P2P_CONNECTION_TIMEOUT) => {
                    warn!(
                        connection_id = %state.connection_id,
                        attempt,
                        "Rendezvous attempt timed out"
                    );
                    false
                }
            };

            if confirmed {
                state.lock().status = RendezvousStatus::Connected;
                info!(
                    connection_id = %state.connection_id,
                    attempt,
                    "Both agents confirmed, rendezvous connected"
                );
                let _ = self
                    .confirmed_tx
                    .send(RendezvousConfirmed {
                        connection_id: state.connection_id.clone(),
                        requesting: state.requesting.clone(),
                        source: state.source.clone(),
                        path: state.path.clone(),
                    })
                    .await;
                // Retain state until the transfer reports a terminal
                // status and the manager removes us.
                state.cancel.cancelled().await;
                return;
            }

            state.lock().retry_count = attempt;
            // Drain any straggling verdicts for this attempt.
            while failure_rx.try_recv().is_ok() {}

            if attempt < P2P_MAX_RETRIES {
                let backoff = P2P_INITIAL_BACKOFF * 2u32.saturating_pow(attempt - 1);
                tokio::select! {
                    _ = state.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        state.lock().status = RendezvousStatus::Failed;
        warn!(
            connection_id = %state.connection_id,
            attempts = P2P_MAX_RETRIES,
            "Rendezvous exhausted retries"
        );
        let _ = self
            .failed_tx
            .send(RendezvousFailed {
                connection_id: state.connection_id.clone(),
                requesting: state.requesting.clone(),
                source: state.source.clone(),
                path: state.path.clone(),
                reason: "max retries exceeded".to_string(),
            })
            .await;
    }

    fn send_initiations(
        &self,
        state: &TransferState,
        requesting_endpoint: &str,
        source_endpoint: &str,
        attempt: u32,
    ) {
        debug!(
            connection_id = %state.connection_id,
            attempt,
            "Sending dial instructions to both agents"
        );
        // Each side is told to dial the *other* side's endpoint.
        self.sender.send_to(
            &state.requesting,
            Frame::MasterP2pInitiate(P2pInitiate {
                connection_id: state.connection_id.clone(),
                target_agent_id: state.source.clone(),
                target_endpoint: source_endpoint.to_string(),
                attempt_number: attempt,
                max_attempts: P2P_MAX_RETRIES,
                countdown_seconds: P2P_COUNTDOWN_SECONDS,
            })
            .into(),
        );
        self.sender.send_to(
            &state.source,
            Frame::MasterP2pInitiate(P2pInitiate {
                connection_id: state.connection_id.clone(),
                target_agent_id: state.requesting.clone(),
                target_endpoint: requesting_endpoint.to_string(),
                attempt_number: attempt,
                max_attempts: P2P_MAX_RETRIES,
                countdown_seconds: P2P_COUNTDOWN_SECONDS,
            })
            .into(),
        );
    }
}
