//! Protocol and timing constants for NebulaLink.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Maximum binary frame payload on the control session (2 MiB).
pub const MAX_BINARY_FRAME: usize = 2 * 1024 * 1024;

/// Archive stream chunk size (64 KiB).
pub const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;

/// Capacity of the agent's outbound send buffer (items).
pub const SEND_BUFFER_CAPACITY: usize = 1024;

/// Capacity of the inbound frame buffer (items).
pub const INBOUND_BUFFER_CAPACITY: usize = 1024;

/// Capacity of the master's per-connection binary stream buffer (chunks).
pub const STREAM_BUFFER_CAPACITY: usize = 1024;

/// How long the master's reader blocks enqueueing a binary chunk before
/// dropping the connection.
pub const STREAM_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Session Health
// =============================================================================

/// A ping (or any traffic) must arrive within this window or the session
/// is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Master ping cadence; must be well under [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(30);

/// Socket write deadline per frame.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Fixed supervisor backoff between redials.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Default heartbeat interval when `HEARTBEAT_TIMER` is unset (seconds).
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

// =============================================================================
// Peer Rendezvous
// =============================================================================

/// Maximum rendezvous attempts before falling back to relay.
pub const P2P_MAX_RETRIES: u32 = 3;

/// Wait for both agents to confirm an attempt.
pub const P2P_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Base for the exponential retry backoff (1s, 2s, 4s, ...).
pub const P2P_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Synchronized-dial countdown sent to both agents.
pub const P2P_COUNTDOWN_SECONDS: u64 = 3;

/// TCP dial deadline for the direct leg.
pub const P2P_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Transfers
// =============================================================================

/// Cadence of `running` status frames while a relay stream is in flight.
pub const RUNNING_STATUS_PERIOD: Duration = Duration::from_secs(2);

/// Subdirectory of the shared folder that receives extracted transfers.
pub const TRANSFERS_DIR: &str = "transfers";

/// Shared folder name under the user's Desktop.
pub const SHARED_FOLDER_NAME: &str = "NebulaLink-shared";

// =============================================================================
// Logging
// =============================================================================

/// Agent log file is rotated aside once it exceeds this size.
pub const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Default agent log file name.
pub const AGENT_LOG_FILE: &str = "agent.log";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_constants_are_ordered() {
        assert!(PING_PERIOD < PONG_WAIT);
        assert!(WRITE_WAIT < PONG_WAIT);
        assert!(P2P_INITIAL_BACKOFF < P2P_CONNECTION_TIMEOUT);
        assert!(P2P_DIAL_TIMEOUT < P2P_CONNECTION_TIMEOUT);
    }

    #[test]
    fn chunks_fit_in_binary_frames() {
        assert!(ARCHIVE_CHUNK_SIZE <= MAX_BINARY_FRAME);
    }

    #[test]
    fn send_buffer_meets_contract() {
        // The session contract promises a send buffer of at least 1024 items.
        assert!(SEND_BUFFER_CAPACITY >= 1024);
    }
}
