//! Hub of agent control sessions.
//!
//! Connections are keyed by the stable agent id. Reconnection replaces
//! the socket and workers in place: the old workers are cancelled and
//! drained, then fresh ones start against the same registration, so the
//! id keeps naming the same agent across drops.
//!
//! Locking policy: the outer connections map and each connection's small
//! mutable fields sit behind reader-writer locks held only across the
//! field access itself, never across I/O or channel sends.

mod pumps;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::SystemTime;

use axum::extract::ws::WebSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nebula_core::constants::{INBOUND_BUFFER_CAPACITY, STREAM_BUFFER_CAPACITY};
use nebula_core::protocol::{Frame, FrameKind, MetricsReport, Outbound};
use nebula_core::{Error, Result};

use crate::sse::SseHub;
use crate::transfer::{ConnectionDirectory, FrameSender};

/// Per-connection send buffer (items).
const HUB_SEND_BUFFER: usize = 256;

/// Handler invoked by a connection's processor for one frame kind.
pub type HubHandler = Arc<dyn Fn(Frame, Arc<Connection>) -> Result<()> + Send + Sync>;

/// One agent's registration, surviving socket replacement.
pub struct Connection {
    pub id: String,
    name: StdRwLock<String>,
    os: StdRwLock<String>,
    public_endpoint: StdRwLock<Option<String>>,
    relay_to: StdRwLock<Option<String>>,
    last_seen: StdRwLock<SystemTime>,
    last_metrics: StdRwLock<Option<MetricsReport>>,
    connected: AtomicBool,
    generation: AtomicU64,
    send_tx: StdRwLock<Option<mpsc::Sender<Outbound>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    cancel: StdRwLock<CancellationToken>,
}

impl Connection {
    fn new(id: String, name: String, os: String) -> Self {
        Self {
            id,
            name: StdRwLock::new(name),
            os: StdRwLock::new(os),
            public_endpoint: StdRwLock::new(None),
            relay_to: StdRwLock::new(None),
            last_seen: StdRwLock::new(SystemTime::now()),
            last_metrics: StdRwLock::new(None),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            send_tx: StdRwLock::new(None),
            workers: StdMutex::new(Vec::new()),
            cancel: StdRwLock::new(CancellationToken::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().expect("name lock").clone()
    }

    pub fn os(&self) -> String {
        self.os.read().expect("os lock").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> SystemTime {
        *self.last_seen.read().expect("last_seen lock")
    }

    pub fn last_metrics(&self) -> Option<MetricsReport> {
        self.last_metrics.read().expect("metrics lock").clone()
    }

    pub fn set_last_metrics(&self, report: MetricsReport) {
        *self.last_metrics.write().expect("metrics lock") = Some(report);
    }

    pub fn public_endpoint(&self) -> Option<String> {
        self.public_endpoint.read().expect("endpoint lock").clone()
    }

    pub fn set_public_endpoint(&self, endpoint: Option<String>) {
        *self.public_endpoint.write().expect("endpoint lock") = endpoint;
    }

    pub fn relay_to(&self) -> Option<String> {
        self.relay_to.read().expect("relay lock").clone()
    }

    pub fn set_relay_to(&self, target: Option<String>) {
        *self.relay_to.write().expect("relay lock") = target;
    }

    pub(crate) fn touch(&self) {
        *self.last_seen.write().expect("last_seen lock") = SystemTime::now();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().expect("cancel lock").clone()
    }

    fn send(&self, out: Outbound) -> Result<()> {
        let tx = {
            let guard = self.send_tx.read().expect("send lock");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(Error::AgentOffline(self.id.clone()));
        };
        match tx.try_send(out) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Channel {
                message: format!("send channel full for {}", self.id),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::AgentOffline(self.id.clone())),
        }
    }
}

/// Snapshot row for the REST surface.
#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub os: String,
    pub last_seen: SystemTime,
    pub online: bool,
}

/// Accepts agent sockets and routes frames by agent id.
pub struct Hub {
    connections: StdRwLock<HashMap<String, Arc<Connection>>>,
    handlers: StdRwLock<HashMap<FrameKind, HubHandler>>,
    sse: SseHub,
}

impl Hub {
    pub fn new(sse: SseHub) -> Arc<Self> {
        Arc::new(Self {
            connections: StdRwLock::new(HashMap::new()),
            handlers: StdRwLock::new(HashMap::new()),
            sse,
        })
    }

    pub fn sse(&self) -> &SseHub {
        &self.sse
    }

    /// Install a handler for one frame kind; later registration overrides.
    pub fn register_handler(&self, kind: FrameKind, handler: HubHandler) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(kind, handler);
    }

    /// Register or re-register an agent and run its connection to
    /// completion. Returns when the socket dies or is replaced.
    pub async fn attach(
        self: Arc<Self>,
        name: String,
        id: String,
        os: String,
        socket: WebSocket,
    ) {
        let conn = {
            let mut guard = self.connections.write().expect("connections poisoned");
            Arc::clone(
                guard
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(Connection::new(id.clone(), name.clone(), os.clone()))),
            )
        };

        // Displace any previous socket's workers.
        let old_cancel = conn.cancel_token();
        old_cancel.cancel();
        let old_workers: Vec<JoinHandle<()>> = {
            let mut guard = conn.workers.lock().expect("workers lock");
            guard.drain(..).collect()
        };
        let reconnect = !old_workers.is_empty();
        for worker in old_workers {
            let _ = worker.await;
        }
        if reconnect {
            info!(agent_id = %conn.id, "Reconnecting agent");
        } else {
            info!(agent_id = %conn.id, name = %name, os = %os, "New agent connection");
        }

        // Refresh identity fields and plumbing.
        *conn.name.write().expect("name lock") = name;
        if !os.is_empty() {
            *conn.os.write().expect("os lock") = os;
        }
        conn.touch();
        conn.connected.store(true, Ordering::SeqCst);
        let generation = conn.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let cancel = CancellationToken::new();
        *conn.cancel.write().expect("cancel lock") = cancel.clone();
        let (send_tx, send_rx) = mpsc::channel(HUB_SEND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_BUFFER_CAPACITY);
        *conn.send_tx.write().expect("send lock") = Some(send_tx);

        {
            let mut guard = conn.workers.lock().expect("workers lock");
            *guard = pumps::start(
                Arc::clone(&self),
                Arc::clone(&conn),
                socket,
                cancel.clone(),
                send_rx,
                inbound_tx,
                inbound_rx,
                stream_tx,
                stream_rx,
            );
        }

        // Hold the upgrade future open until this socket generation ends.
        cancel.cancelled().await;

        // Only the generation that created this socket cleans up; a
        // replacement has already taken over the registration.
        if conn.generation.load(Ordering::SeqCst) == generation {
            conn.connected.store(false, Ordering::SeqCst);
            *conn.send_tx.write().expect("send lock") = None;
            conn.touch();
            info!(agent_id = %conn.id, "Agent disconnected");
            self.sse.broadcast_json(serde_json::json!({
                "type": "agent_disconnected",
                "payload": { "agent_id": conn.id },
            }));
        }
    }

    /// Non-blocking send to an agent's session.
    pub fn send_to(&self, agent_id: &str, out: Outbound) -> Result<()> {
        let conn = self
            .connection(agent_id)
            .ok_or_else(|| Error::AgentOffline(agent_id.to_string()))?;
        if !conn.is_connected() {
            return Err(Error::AgentOffline(agent_id.to_string()));
        }
        conn.send(out)
    }

    /// Send a frame, logging failures instead of returning them.
    pub fn send_frame(&self, agent_id: &str, frame: Frame) {
        if let Err(e) = self.send_to(agent_id, Outbound::Frame(frame)) {
            warn!(agent_id = %agent_id, error = %e, "Frame not delivered");
        }
    }

    pub fn connection(&self, agent_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .expect("connections poisoned")
            .get(agent_id)
            .cloned()
    }

    /// All registrations, connected or not.
    pub fn agents(&self) -> Vec<AgentSummary> {
        self.connections
            .read()
            .expect("connections poisoned")
            .values()
            .map(|conn| AgentSummary {
                id: conn.id.clone(),
                name: conn.name(),
                os: conn.os(),
                last_seen: conn.last_seen(),
                online: conn.is_connected(),
            })
            .collect()
    }

    pub fn relay_to(&self, agent_id: &str) -> Option<String> {
        self.connection(agent_id).and_then(|c| c.relay_to())
    }

    pub fn set_relay_to(&self, agent_id: &str, target: Option<String>) {
        if let Some(conn) = self.connection(agent_id) {
            conn.set_relay_to(target);
        }
    }

    pub(crate) fn dispatch(&self, frame: Frame, conn: &Arc<Connection>) {
        let kind = frame.kind();
        let handler = {
            let guard = self.handlers.read().expect("handler registry poisoned");
            guard.get(&kind).cloned()
        };
        match handler {
            Some(handler) => {
                if let Err(e) = handler(frame, Arc::clone(conn)) {
                    tracing::error!(
                        kind = ?kind,
                        agent_id = %conn.id,
                        error = %e,
                        "Handler error"
                    );
                }
            }
            None => warn!(kind = ?kind, agent_id = %conn.id, "No handler for message type"),
        }
    }

    /// Route one binary chunk from `conn` along its relay binding.
    pub(crate) fn forward_chunk(&self, conn: &Connection, chunk: bytes::Bytes) {
        let Some(target) = conn.relay_to() else {
            tracing::debug!(
                source = %conn.id,
                size = chunk.len(),
                "Binary chunk with no relay target, dropping"
            );
            return;
        };
        if let Err(e) = self.send_to(&target, Outbound::Binary(chunk)) {
            warn!(
                source = %conn.id,
                target = %target,
                error = %e,
                "Relay chunk dropped"
            );
        }
    }

    /// Test hook: register a connection without a socket.
    #[doc(hidden)]
    pub fn insert_detached(
        &self,
        id: &str,
        name: &str,
        os: &str,
        endpoint: Option<String>,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let conn = Arc::new(Connection::new(id.into(), name.into(), os.into()));
        let (send_tx, send_rx) = mpsc::channel(HUB_SEND_BUFFER);
        *conn.send_tx.write().expect("send lock") = Some(send_tx);
        conn.connected.store(true, Ordering::SeqCst);
        conn.set_public_endpoint(endpoint);
        self.connections
            .write()
            .expect("connections poisoned")
            .insert(id.into(), Arc::clone(&conn));
        (conn, send_rx)
    }
}

impl FrameSender for Hub {
    fn send_to(&self, agent_id: &str, out: Outbound) {
        if let Err(e) = Hub::send_to(self, agent_id, out) {
            warn!(agent_id = %agent_id, error = %e, "Send failed");
        }
    }
}

impl ConnectionDirectory for Hub {
    fn is_connected(&self, agent_id: &str) -> bool {
        self.connection(agent_id)
            .is_some_and(|c| c.is_connected())
    }

    fn public_endpoint(&self, agent_id: &str) -> Option<String> {
        self.connection(agent_id).and_then(|c| c.public_endpoint())
    }

    fn set_relay_to(&self, agent_id: &str, target: Option<String>) {
        Hub::set_relay_to(self, agent_id, target);
    }

    fn relay_to(&self, agent_id: &str) -> Option<String> {
        Hub::relay_to(self, agent_id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<Hub> {
        Hub::new(SseHub::new())
    }

    #[tokio::test]
    async fn send_to_unknown_agent_is_offline_error() {
        let hub = hub();
        let err = hub
            .send_to("ghost", Outbound::Frame(Frame::MasterMetricsRequest))
            .unwrap_err();
        assert!(matches!(err, Error::AgentOffline(_)));
    }

    #[tokio::test]
    async fn detached_connection_receives_frames() {
        let hub = hub();
        let (_conn, mut rx) = hub.insert_detached("a1", "one", "Linux", None);

        hub.send_to("a1", Outbound::Frame(Frame::MasterMetricsRequest))
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Frame(Frame::MasterMetricsRequest))
        ));
    }

    #[tokio::test]
    async fn forward_chunk_routes_to_relay_target_only() {
        let hub = hub();
        let (source, _source_rx) = hub.insert_detached("src", "s", "Linux", None);
        let (_dest, mut dest_rx) = hub.insert_detached("dst", "d", "Linux", None);
        let (_other, mut other_rx) = hub.insert_detached("other", "o", "Linux", None);

        // No binding: chunk dropped.
        hub.forward_chunk(&source, bytes::Bytes::from_static(b"early"));

        hub.set_relay_to("src", Some("dst".into()));
        hub.forward_chunk(&source, bytes::Bytes::from_static(b"chunk-1"));
        hub.forward_chunk(&source, bytes::Bytes::from_static(b"chunk-2"));

        match dest_rx.recv().await.unwrap() {
            Outbound::Binary(b) => assert_eq!(&b[..], b"chunk-1"),
            other => panic!("unexpected: {:?}", other),
        }
        match dest_rx.recv().await.unwrap() {
            Outbound::Binary(b) => assert_eq!(&b[..], b"chunk-2"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_chunk_to_absent_target_drops() {
        let hub = hub();
        let (source, _rx) = hub.insert_detached("src", "s", "Linux", None);
        hub.set_relay_to("src", Some("gone".into()));
        // Must not panic or wedge.
        hub.forward_chunk(&source, bytes::Bytes::from_static(b"chunk"));
    }

    #[tokio::test]
    async fn agents_lists_registrations() {
        let hub = hub();
        hub.insert_detached("a1", "one", "Linux", None);
        hub.insert_detached("a2", "two", "Windows", Some("1.2.3.4:5".into()));

        let mut agents = hub.agents();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "one");
        assert!(agents[1].online);
    }

    #[tokio::test]
    async fn directory_view_reports_endpoints() {
        let hub = hub();
        hub.insert_detached("a1", "one", "Linux", Some("9.9.9.9:9".into()));
        let dir: &dyn ConnectionDirectory = hub.as_ref();
        assert!(dir.is_connected("a1"));
        assert_eq!(dir.public_endpoint("a1").as_deref(), Some("9.9.9.9:9"));
        assert!(dir.public_endpoint("nope").is_none());
    }
}
