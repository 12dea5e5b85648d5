//! Transfer status vocabulary.

use serde::{Deserialize, Serialize};

/// How the archive bytes travel between the two agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Direct TCP socket between the agents.
    P2p,
    /// Chunks forwarded by the master over the control sessions.
    Relay,
}

/// Status values reported by agents and forwarded to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Direct dial succeeded for this rendezvous attempt.
    P2pSuccess,
    /// Direct dial failed for this rendezvous attempt.
    P2pFailed,
    /// Source is about to stream; receiver should prepare.
    Initiated,
    /// Periodic liveness while the stream is in flight.
    Running,
    /// Stream drained; receiver should extract.
    Completed,
    /// Terminal failure; receiver should abort.
    TransferFailed,
}

impl TransferStatus {
    /// Whether this status ends the transfer's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::TransferFailed)
    }
}

/// `master_transfer_status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatusUpdate {
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// The reporting agent (or, on forwarded frames, the source agent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransferStatusUpdate {
    /// A bare status report from `agent_id`.
    pub fn report(status: TransferStatus, agent_id: impl Into<String>) -> Self {
        Self {
            status,
            connection_id: None,
            agent_id: Some(agent_id.into()),
            reason: None,
        }
    }

    /// Attach the transfer's connection id.
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Attach a failure reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
