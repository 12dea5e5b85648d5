//! Control-plane message catalog.
//!
//! Every text frame on a control session is a `{type, payload}` JSON
//! object. The catalog is a closed sum type: deserialization picks the
//! variant from the `type` tag and handlers match exhaustively, so there
//! are no string-keyed payload lookups anywhere past the codec boundary.
//!
//! Binary frames carry no envelope; their meaning is established by prior
//! text state transitions and they are represented as raw [`bytes::Bytes`].

mod agent;
mod master;
mod status;

pub use agent::{
    ConnBreak, DirectoryInfo, DirectorySnapshot, FileEntryInfo, HostMetrics, MetricsReport,
};
pub use master::{FallbackAction, P2pInitiate, RelayFallback, TransferIntent, TransferStart};
pub use status::{TransferMode, TransferStatus, TransferStatusUpdate};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Top-level Frame Enum
// =============================================================================

/// Top-level control-plane frame.
///
/// Wire names are the snake_case variant names (`agent_metrics`,
/// `master_p2p_initiate`, ...). Variants without payload serialize with the
/// `payload` key omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    // =========================================================================
    // Agent → master
    // =========================================================================
    /// Periodic heartbeat carrying a host-metrics snapshot.
    AgentMetrics(MetricsReport),
    /// Best-effort notice before the agent closes its session.
    AgentConnBreak(ConnBreak),
    /// Recursive listing of the agent's shared folder.
    AgentDirectorySnapshot(DirectorySnapshot),

    // =========================================================================
    // Master → agent
    // =========================================================================
    /// Ask the agent for a fresh metrics frame.
    MasterMetricsRequest,
    /// Restart the agent service.
    MasterRestartRequest,
    /// Stop and remove the agent service.
    MasterUninstallInitiated,
    /// Heads-up to both parties that a transfer was requested.
    MasterTransferIntent(TransferIntent),
    /// Synchronized-dial instruction for one rendezvous attempt.
    MasterP2pInitiate(P2pInitiate),
    /// Begin sending over the established direct link.
    MasterP2pTransferStart(TransferStart),
    /// Begin sending over the control session (relay mode).
    MasterRelayTransferStart(TransferStart),
    /// Rendezvous gave up; both sides switch to relay roles.
    MasterRelayFallback(RelayFallback),

    // =========================================================================
    // Both directions
    // =========================================================================
    /// Transfer status report (agent → master) or forwarded status
    /// (master → requesting agent).
    MasterTransferStatus(TransferStatusUpdate),
}

/// Discriminant of [`Frame`], used as the handler-registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    AgentMetrics,
    AgentConnBreak,
    AgentDirectorySnapshot,
    MasterMetricsRequest,
    MasterRestartRequest,
    MasterUninstallInitiated,
    MasterTransferIntent,
    MasterP2pInitiate,
    MasterP2pTransferStart,
    MasterRelayTransferStart,
    MasterRelayFallback,
    MasterTransferStatus,
}

impl Frame {
    /// The registry key for this frame.
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::AgentMetrics(_) => FrameKind::AgentMetrics,
            Frame::AgentConnBreak(_) => FrameKind::AgentConnBreak,
            Frame::AgentDirectorySnapshot(_) => FrameKind::AgentDirectorySnapshot,
            Frame::MasterMetricsRequest => FrameKind::MasterMetricsRequest,
            Frame::MasterRestartRequest => FrameKind::MasterRestartRequest,
            Frame::MasterUninstallInitiated => FrameKind::MasterUninstallInitiated,
            Frame::MasterTransferIntent(_) => FrameKind::MasterTransferIntent,
            Frame::MasterP2pInitiate(_) => FrameKind::MasterP2pInitiate,
            Frame::MasterP2pTransferStart(_) => FrameKind::MasterP2pTransferStart,
            Frame::MasterRelayTransferStart(_) => FrameKind::MasterRelayTransferStart,
            Frame::MasterRelayFallback(_) => FrameKind::MasterRelayFallback,
            Frame::MasterTransferStatus(_) => FrameKind::MasterTransferStatus,
        }
    }

    /// Encode to the wire JSON form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the wire JSON form.
    ///
    /// Unknown `type` tags and malformed payloads surface as
    /// [`Error::Codec`]; callers log and drop per the protocol-error
    /// policy.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Codec {
            message: e.to_string(),
        })
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// A unit queued on a session's send buffer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Text frame.
    Frame(Frame),
    /// Opaque binary chunk (relay data path).
    Binary(Bytes),
    /// Transport-level pong echoing a ping payload.
    Pong(Bytes),
    /// Transport-level ping.
    Ping(Bytes),
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Outbound::Frame(frame)
    }
}

// =============================================================================
// Tests
// =============================================================================
