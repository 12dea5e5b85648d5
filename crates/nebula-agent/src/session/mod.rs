//! Agent-side control session.
//!
//! One outbound WebSocket connection to the master, run by three
//! cooperative workers: a reader (socket → inbound queue), a writer
//! (send queue → socket) and a processor (inbound queue → typed
//! handlers). While a relay transfer is receiving, the processor also
//! feeds binary chunks into an installed chunk sink.
//!
//! The session is replaced wholesale on reconnect; the supervisor owns
//! that loop.

mod pumps;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nebula_core::constants::{INBOUND_BUFFER_CAPACITY, SEND_BUFFER_CAPACITY};
use nebula_core::protocol::{Frame, FrameKind, Outbound};
use nebula_core::{AgentIdentity, Error, Result};

use crate::config::AgentConfig;

/// A typed frame handler. Exactly one handler per frame kind; long work is
/// expected to spawn its own task.
pub type Handler = Box<dyn Fn(Frame) -> Result<()> + Send + Sync>;

/// Unit read off the socket.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Frame),
    Binary(Bytes),
}

/// Live control session to the master.
pub struct Session {
    identity: AgentIdentity,
    outbound_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    handlers: StdRwLock<HashMap<FrameKind, Handler>>,
    chunk_sink: StdMutex<Option<mpsc::Sender<Bytes>>>,
}

impl Session {
    /// Dial the master and start the session workers.
    pub async fn connect(
        config: &AgentConfig,
        identity: AgentIdentity,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let url = config.ws_url(&identity.id, &identity.name, &identity.os);
        info!(url = %url, "Dialing master");

        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Session {
                message: format!("dial failed: {}", e),
            })?;
        info!("Connected to master");

        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_CAPACITY);

        let session = Arc::new(Self {
            identity,
            outbound_tx,
            cancel: parent.child_token(),
            handlers: StdRwLock::new(HashMap::new()),
            chunk_sink: StdMutex::new(None),
        });

        pumps::start(Arc::clone(&session), socket, inbound_tx, inbound_rx, outbound_rx);
        Ok(session)
    }

    /// The identity this session was dialed with.
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Shorthand for the stable agent id.
    pub fn agent_id(&self) -> &str {
        &self.identity.id
    }

    /// Non-blocking enqueue onto the send buffer.
    ///
    /// Returns a channel error ("send buffer full") when the buffer is at
    /// capacity; the session stays up.
    pub fn send(&self, out: impl Into<Outbound>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        match self.outbound_tx.try_send(out.into()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Send buffer full, dropping message");
                Err(Error::Channel {
                    message: "send buffer full".into(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
        }
    }

    /// Enqueue a binary chunk, politely waiting out send-buffer pressure.
    ///
    /// Relay senders use this instead of [`Session::send`]: dropping a
    /// chunk would corrupt the archive, so a full buffer is waited out in
    /// small sleeps rather than reported as an error.
    pub async fn send_binary(&self, chunk: Bytes) -> Result<()> {
        let mut out = Outbound::Binary(chunk);
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }
            match self.outbound_tx.try_send(out) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    out = returned;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::ConnectionClosed),
            }
        }
    }

    /// Install a typed handler. A later registration for the same kind
    /// overrides the earlier one.
    pub fn register_handler(&self, kind: FrameKind, handler: Handler) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(kind, handler);
    }

    /// Route binary chunks into `sink` (relay receive mode).
    pub fn install_chunk_sink(&self, sink: mpsc::Sender<Bytes>) {
        *self.chunk_sink.lock().expect("chunk sink poisoned") = Some(sink);
    }

    /// Stop routing binary chunks; subsequent chunks are dropped with a
    /// warning.
    pub fn clear_chunk_sink(&self) {
        *self.chunk_sink.lock().expect("chunk sink poisoned") = None;
    }

    pub(crate) fn take_chunk_sink_if_closed(&self) {
        let mut guard = self.chunk_sink.lock().expect("chunk sink poisoned");
        if guard.as_ref().is_some_and(|tx| tx.is_closed()) {
            *guard = None;
        }
    }

    pub(crate) fn chunk_sink(&self) -> Option<mpsc::Sender<Bytes>> {
        self.chunk_sink.lock().expect("chunk sink poisoned").clone()
    }

    pub(crate) fn dispatch(&self, frame: Frame) {
        let kind = frame.kind();
        let handlers = self.handlers.read().expect("handler registry poisoned");
        match handlers.get(&kind) {
            Some(handler) => {
                if let Err(e) = handler(frame) {
                    tracing::error!(kind = ?kind, error = %e, "Handler error");
                }
            }
            None => warn!(kind = ?kind, "No handler for message type"),
        }
    }

    /// Token observed by heartbeats and transfer workers; cancelled when
    /// the session dies.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the session is torn down.
    pub async fn disconnected(&self) {
        self.cancel.cancelled().await;
    }

    /// Tear the session down; all workers stop and the socket closes.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Build a detached in-memory session (no socket) for tests.
    ///
    /// Returns the session, the far end of the send buffer, and a feeder
    /// for the processor queue.
    #[doc(hidden)]
    pub fn detached(
        identity: AgentIdentity,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>, mpsc::Sender<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Frame>(INBOUND_BUFFER_CAPACITY);
        let session = Arc::new(Self {
            identity,
            outbound_tx,
            cancel: CancellationToken::new(),
            handlers: StdRwLock::new(HashMap::new()),
            chunk_sink: StdMutex::new(None),
        });
        let dispatcher = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                dispatcher.dispatch(frame);
            }
        });
        (session, outbound_rx, inbound_tx)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn identity() -> AgentIdentity {
        AgentIdentity::from_parts("agent-1", "one", "Linux")
    }

    #[tokio::test]
    async fn send_buffer_full_is_reported_not_fatal() {
        let (session, _outbound_rx, _tx) = Session::detached(identity());

        // Nothing drains the buffer; fill it to capacity.
        for _ in 0..SEND_BUFFER_CAPACITY {
            session.send(Frame::MasterMetricsRequest).unwrap();
        }
        let err = session.send(Frame::MasterMetricsRequest).unwrap_err();
        assert!(matches!(err, Error::Channel { .. }));
        assert_eq!(err.to_string(), "channel error: send buffer full");

        // The session itself is still usable.
        assert!(!session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn send_after_close_is_connection_closed() {
        let (session, _outbound_rx, _tx) = Session::detached(identity());
        session.close();
        let err = session.send(Frame::MasterMetricsRequest).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn handler_registration_overrides() {
        let (session, _outbound_rx, tx) = Session::detached(identity());
        let hits = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&hits);
        session.register_handler(
            FrameKind::MasterMetricsRequest,
            Box::new(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        // Later registration wins.
        let second = Arc::clone(&hits);
        session.register_handler(
            FrameKind::MasterMetricsRequest,
            Box::new(move |_| {
                second.fetch_add(100, Ordering::SeqCst);
                Ok(())
            }),
        );

        tx.send(Frame::MasterMetricsRequest).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn unhandled_frame_is_dropped_quietly() {
        let (session, _outbound_rx, tx) = Session::detached(identity());
        // No handler registered; dispatch must not panic.
        tx.send(Frame::MasterRestartRequest).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn chunk_sink_install_and_clear() {
        let (session, _outbound_rx, _tx) = Session::detached(identity());
        assert!(session.chunk_sink().is_none());

        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        session.install_chunk_sink(tx);
        session
            .chunk_sink()
            .unwrap()
            .try_send(Bytes::from_static(b"abc"))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));

        session.clear_chunk_sink();
        assert!(session.chunk_sink().is_none());
    }
}
