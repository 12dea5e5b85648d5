//! Direct peer link: one TCP connection per rendezvous.
//!
//! Both sides of a rendezvous dial each other's reported endpoint after a
//! shared countdown (the simultaneous-open premise). The link tracks at
//! most one active connection; a new attempt for a different
//! `connection_id` displaces the old one.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use nebula_core::constants::P2P_DIAL_TIMEOUT;
use nebula_core::protocol::P2pInitiate;
use nebula_core::{Error, Result};

/// Connection state of the active peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Failed,
    Closed,
}

struct PeerConnection {
    connection_id: String,
    target_agent_id: String,
    target_endpoint: String,
    attempt_number: u32,
    status: LinkStatus,
    stream: Option<TcpStream>,
}

/// Holder of the (at most one) active direct connection.
pub struct DirectLink {
    active: Mutex<Option<PeerConnection>>,
}

impl DirectLink {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    /// Run one synchronized-dial attempt.
    ///
    /// Sleeps out the countdown, dials with a 10 s deadline, and records
    /// the outcome. Returns Ok on an established connection; the caller
    /// reports the result to the master either way.
    pub async fn attempt(&self, init: &P2pInitiate) -> Result<()> {
        {
            let mut guard = self.active.lock().await;
            if let Some(existing) = guard.as_mut() {
                if existing.connection_id != init.connection_id {
                    existing.stream.take();
                    existing.status = LinkStatus::Closed;
                }
            }
            *guard = Some(PeerConnection {
                connection_id: init.connection_id.clone(),
                target_agent_id: init.target_agent_id.clone(),
                target_endpoint: init.target_endpoint.clone(),
                attempt_number: init.attempt_number,
                status: LinkStatus::Connecting,
                stream: None,
            });
        }

        info!(
            connection_id = %init.connection_id,
            target = %init.target_endpoint,
            attempt = init.attempt_number,
            countdown = init.countdown_seconds,
            "Direct connection attempt"
        );
        tokio::time::sleep(Duration::from_secs(init.countdown_seconds)).await;

        let dialed = timeout(P2P_DIAL_TIMEOUT, TcpStream::connect(&init.target_endpoint)).await;
        let stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.mark_failed(&init.connection_id).await;
                warn!(
                    connection_id = %init.connection_id,
                    target = %init.target_endpoint,
                    error = %e,
                    "Direct connection failed"
                );
                return Err(Error::transfer(format!("connection failed: {}", e)));
            }
            Err(_) => {
                self.mark_failed(&init.connection_id).await;
                warn!(
                    connection_id = %init.connection_id,
                    target = %init.target_endpoint,
                    "Direct connection timed out"
                );
                return Err(Error::transfer("connection failed: dial timed out"));
            }
        };

        let mut guard = self.active.lock().await;
        match guard.as_mut() {
            Some(conn) if conn.connection_id == init.connection_id => {
                conn.stream = Some(stream);
                conn.status = LinkStatus::Connected;
                info!(
                    connection_id = %init.connection_id,
                    target = %init.target_endpoint,
                    "Direct connection established"
                );
                Ok(())
            }
            _ => {
                // Displaced while dialing; the socket closes on drop.
                Err(Error::transfer("connection displaced during dial"))
            }
        }
    }

    /// Whether an established link to `target_agent_id` exists.
    pub async fn is_connected_to(&self, target_agent_id: &str) -> bool {
        let guard = self.active.lock().await;
        guard.as_ref().is_some_and(|c| {
            c.target_agent_id == target_agent_id && c.status == LinkStatus::Connected
        })
    }

    /// Take the socket for the link to `target_agent_id`, if established.
    ///
    /// Ownership of the stream moves to the caller; the link entry stays
    /// until [`DirectLink::close`].
    pub async fn take_stream(&self, target_agent_id: &str) -> Option<(String, TcpStream)> {
        let mut guard = self.active.lock().await;
        let conn = guard.as_mut()?;
        if conn.target_agent_id != target_agent_id || conn.status != LinkStatus::Connected {
            return None;
        }
        let stream = conn.stream.take()?;
        Some((conn.connection_id.clone(), stream))
    }

    /// Close the active link. With a `connection_id`, only a matching link
    /// is closed; with `None`, whatever is active.
    pub async fn close(&self, connection_id: Option<&str>) {
        let mut guard = self.active.lock().await;
        let Some(conn) = guard.as_ref() else {
            return;
        };
        if let Some(id) = connection_id {
            if conn.connection_id != id {
                return;
            }
        }
        let closed = guard.take().expect("checked above");
        info!(connection_id = %closed.connection_id, "Direct connection closed");
    }

    /// Debug view of the active link for logs.
    pub async fn describe(&self) -> Option<(String, String, LinkStatus, u32)> {
        let guard = self.active.lock().await;
        guard.as_ref().map(|c| {
            (
                c.connection_id.clone(),
                c.target_endpoint.clone(),
                c.status,
                c.attempt_number,
            )
        })
    }

    async fn mark_failed(&self, connection_id: &str) {
        let mut guard = self.active.lock().await;
        if let Some(conn) = guard.as_mut() {
            if conn.connection_id == connection_id {
                conn.status = LinkStatus::Failed;
                *guard = None;
            }
        }
    }
}

impl Default for DirectLink {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn init(connection_id: &str, target: &str, endpoint: &str) -> P2pInitiate {
        P2pInitiate {
            connection_id: connection_id.into(),
            target_agent_id: target.into(),
            target_endpoint: endpoint.into(),
            attempt_number: 1,
            max_attempts: 3,
            countdown_seconds: 0,
        }
    }

    #[tokio::test]
    async fn attempt_connects_to_listening_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let link = DirectLink::new();
        link.attempt(&init("c-1", "peer", &addr.to_string()))
            .await
            .unwrap();
        assert!(link.is_connected_to("peer").await);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn attempt_against_dead_endpoint_fails() {
        // Bind and immediately drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let link = DirectLink::new();
        let err = link
            .attempt(&init("c-2", "peer", &addr.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));
        assert!(!link.is_connected_to("peer").await);
        assert!(link.describe().await.is_none());
    }

    #[tokio::test]
    async fn take_stream_moves_socket_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let link = DirectLink::new();
        link.attempt(&init("c-3", "peer", &addr.to_string()))
            .await
            .unwrap();

        let (cid, mut stream) = link.take_stream("peer").await.unwrap();
        assert_eq!(cid, "c-3");
        assert!(link.take_stream("peer").await.is_none());

        use tokio::io::AsyncWriteExt;
        stream.write_all(b"payload").await.unwrap();
        stream.shutdown().await.unwrap();
        assert_eq!(accept.await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn close_with_wrong_id_is_a_noop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let link = DirectLink::new();
        link.attempt(&init("c-4", "peer", &addr.to_string()))
            .await
            .unwrap();
        link.close(Some("other")).await;
        assert!(link.is_connected_to("peer").await);
        link.close(Some("c-4")).await;
        assert!(!link.is_connected_to("peer").await);
    }
}
