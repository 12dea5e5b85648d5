//! Error types for nebula-core.

use thiserror::Error;

/// Main error type for NebulaLink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Control session is gone or was never established.
    #[error("connection closed")]
    ConnectionClosed,

    /// Bounded channel refused a non-blocking enqueue.
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Session-level failure (dial, upgrade, worker).
    #[error("session error: {message}")]
    Session { message: String },

    /// Transfer-level failure; terminal for the transfer, not the session.
    #[error("transfer error: {message}")]
    Transfer { message: String },

    /// Archive production or extraction failure.
    #[error("archive error: {message}")]
    Archive { message: String },

    /// Requested agent is unknown or has no live session.
    #[error("agent offline: {0}")]
    AgentOffline(String),

    /// Configuration is missing or invalid.
    #[error("config error: {message}")]
    Config { message: String },

    /// OS service management failure.
    #[error("service error: {message}")]
    Service { message: String },
}

impl Error {
    /// Returns true if this error is transient and a retry or reconnect may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout
                | Error::ConnectionClosed
                | Error::Channel { .. }
                | Error::Session { .. }
        )
    }

    /// Returns true if this error is fatal for the process.
    ///
    /// Fatal errors are configuration or privilege problems that no amount
    /// of reconnecting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::Service { .. })
    }

    /// Convenience constructor for transfer failures.
    pub fn transfer(message: impl Into<String>) -> Self {
        Error::Transfer {
            message: message.into(),
        }
    }

    /// Convenience constructor for protocol violations.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec {
            message: err.to_string(),
        }
    }
}

/// Convenience result type for NebulaLink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::protocol("unknown message type");
        assert_eq!(err.to_string(), "protocol error: unknown message type");
    }

    #[test]
    fn error_display_agent_offline() {
        let err = Error::AgentOffline("agent-42".into());
        assert_eq!(err.to_string(), "agent offline: agent-42");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Codec { .. }));
    }

    #[test]
    fn transient_errors() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::ConnectionClosed.is_transient());
        assert!(
            Error::Channel {
                message: "send buffer full".into()
            }
            .is_transient()
        );
        assert!(
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            ))
            .is_transient()
        );

        // These should not be transient
        assert!(!Error::protocol("bad").is_transient());
        assert!(
            !Error::Config {
                message: "MASTER_URL missing".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn fatal_errors() {
        assert!(
            Error::Config {
                message: "MASTER_URL missing".into()
            }
            .is_fatal()
        );
        assert!(
            Error::Service {
                message: "permission denied".into()
            }
            .is_fatal()
        );

        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::transfer("stream broke").is_fatal());
    }
}
