//! Agent-side transfer engine.
//!
//! One engine per control session. A transfer runs in one of two modes:
//! direct (archive bytes over the peer TCP link) or relay (archive chunks
//! as binary frames over the control session, forwarded by the master).
//! At most one transfer context is active at a time; a second request is
//! rejected while one is in flight.

mod link;

pub use link::{DirectLink, LinkStatus};

use std::sync::Arc;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nebula_core::archive::{extract_archive, stream_path};
use nebula_core::constants::RUNNING_STATUS_PERIOD;
use nebula_core::protocol::{
    Frame, P2pInitiate, TransferMode, TransferStatus, TransferStatusUpdate,
};
use nebula_core::{Error, Result};

use crate::config::AgentConfig;
use crate::session::Session;

/// Which side of the transfer this agent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

/// Rejection message for a second transfer while one is in flight.
const TRANSFER_BUSY: &str = "another transfer is in progress";

/// Bookkeeping for the one in-flight transfer.
struct TransferContext {
    peer_id: String,
    role: TransferRole,
    mode: TransferMode,
    connection_id: Option<String>,
    temp: Option<NamedTempFile>,
    /// Writer task draining the socket or chunk sink into the temp file.
    writer: Option<JoinHandle<std::io::Result<(u64, u64)>>>,
}

/// Dual-mode transfer engine bound to one session.
pub struct TransferManager {
    session: Arc<Session>,
    config: Arc<AgentConfig>,
    link: DirectLink,
    active: Mutex<Option<TransferContext>>,
}

impl TransferManager {
    pub fn new(session: Arc<Session>, config: Arc<AgentConfig>) -> Arc<Self> {
        Arc::new(Self {
            session,
            config,
            link: DirectLink::new(),
            active: Mutex::new(None),
        })
    }

    // =========================================================================
    // Rendezvous
    // =========================================================================

    /// Run one synchronized-dial attempt and report the outcome.
    pub async fn attempt_p2p(&self, init: P2pInitiate) {
        let outcome = self.link.attempt(&init).await;
        let agent_id = self.session.agent_id().to_string();
        let update = match outcome {
            Ok(()) => TransferStatusUpdate::report(TransferStatus::P2pSuccess, agent_id)
                .with_connection_id(&init.connection_id),
            Err(e) => TransferStatusUpdate::report(TransferStatus::P2pFailed, agent_id)
                .with_connection_id(&init.connection_id)
                .with_reason(e.to_string()),
        };
        if let Err(e) = self.session.send(Frame::MasterTransferStatus(update)) {
            error!(error = %e, "Failed to report rendezvous outcome");
        }
    }

    /// Whether an established direct link to `peer` exists.
    pub async fn has_direct_link_to(&self, peer: &str) -> bool {
        self.link.is_connected_to(peer).await
    }

    /// Close the direct link for `connection_id` (relay fallback path).
    pub async fn close_link(&self, connection_id: &str) {
        self.link.close(Some(connection_id)).await;
    }

    // =========================================================================
    // Send
    // =========================================================================

    /// Stream `path` (shared-folder relative) to `requesting_agent_id`.
    pub async fn send(
        &self,
        path: &str,
        requesting_agent_id: &str,
        mode: TransferMode,
        connection_id: Option<String>,
    ) -> Result<()> {
        let result = match mode {
            TransferMode::P2p => {
                self.send_direct(path, requesting_agent_id, connection_id.clone())
                    .await
            }
            TransferMode::Relay => {
                self.send_relay(path, requesting_agent_id, connection_id.clone())
                    .await
            }
        };
        if let Err(e) = &result {
            // A busy rejection never started this transfer; a status
            // report would clobber the one actually in flight.
            if e.to_string() != format!("transfer error: {}", TRANSFER_BUSY) {
                self.report_status(
                    TransferStatus::TransferFailed,
                    connection_id.as_deref(),
                    Some(&e.to_string()),
                );
            }
        }
        result
    }

    async fn send_direct(
        &self,
        path: &str,
        requesting_agent_id: &str,
        connection_id: Option<String>,
    ) -> Result<()> {
        let abs = self.config.resolve_shared_path(path)?;

        if !self
            .begin(
                requesting_agent_id,
                TransferRole::Sender,
                TransferMode::P2p,
                connection_id.clone(),
            )
            .await?
        {
            return Ok(());
        }

        let Some((link_id, mut stream)) = self.link.take_stream(requesting_agent_id).await
        else {
            self.end().await;
            return Err(Error::transfer("direct connection not available"));
        };
        let connection_id = connection_id.or(Some(link_id.clone()));

        info!(path = %abs.display(), target = %requesting_agent_id, "Starting direct transfer");
        self.report_status(TransferStatus::Initiated, connection_id.as_deref(), None);

        let mut archive = stream_path(abs);
        let outcome: Result<u64> = async {
            let mut total: u64 = 0;
            while let Some(chunk) = archive.data.recv().await {
                total += chunk.len() as u64;
                stream.write_all(&chunk).await?;
            }
            if let Some(e) = archive.errors.recv().await {
                return Err(e);
            }
            stream.shutdown().await?;
            Ok(total)
        }
        .await;

        self.link.close(Some(&link_id)).await;
        self.end().await;

        let total = outcome?;
        info!(bytes = total, "Direct transfer completed");
        self.report_status(TransferStatus::Completed, connection_id.as_deref(), None);
        Ok(())
    }

    async fn send_relay(
        &self,
        path: &str,
        requesting_agent_id: &str,
        connection_id: Option<String>,
    ) -> Result<()> {
        let abs = self.config.resolve_shared_path(path)?;

        if !self
            .begin(
                requesting_agent_id,
                TransferRole::Sender,
                TransferMode::Relay,
                connection_id.clone(),
            )
            .await?
        {
            return Ok(());
        }

        info!(path = %abs.display(), target = %requesting_agent_id, "Starting relay transfer");
        self.report_status(TransferStatus::Initiated, connection_id.as_deref(), None);

        // Periodic liveness while the stream is in flight.
        let running = CancellationToken::new();
        let ticker_guard = running.clone();
        let ticker_session = Arc::clone(&self.session);
        let ticker_cid = connection_id.clone();
        let agent_id = self.session.agent_id().to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RUNNING_STATUS_PERIOD);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker_guard.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut update =
                            TransferStatusUpdate::report(TransferStatus::Running, agent_id.clone());
                        if let Some(cid) = &ticker_cid {
                            update = update.with_connection_id(cid);
                        }
                        let _ = ticker_session.send(Frame::MasterTransferStatus(update));
                    }
                }
            }
        });

        let mut archive = stream_path(abs);
        let outcome: Result<(u64, u64)> = async {
            let mut chunks: u64 = 0;
            let mut total: u64 = 0;
            while let Some(chunk) = archive.data.recv().await {
                chunks += 1;
                total += chunk.len() as u64;
                if chunks == 1 || chunks % 100 == 0 {
                    debug!(chunk = chunks, total_bytes = total, "Relaying chunks");
                }
                self.session.send_binary(chunk).await?;
            }
            if let Some(e) = archive.errors.recv().await {
                return Err(e);
            }
            Ok((chunks, total))
        }
        .await;

        running.cancel();
        self.end().await;

        let (chunks, total) = outcome?;
        info!(chunks, bytes = total, "Relay transfer completed");
        self.report_status(TransferStatus::Completed, connection_id.as_deref(), None);
        Ok(())
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Prepare to receive from `source_agent_id` in the given mode.
    ///
    /// Creates the temp file before any data is accepted; duplicate
    /// prepare calls for the same source are ignored.
    pub async fn receive(&self, source_agent_id: &str, mode: TransferMode) -> Result<()> {
        if !self
            .begin(source_agent_id, TransferRole::Receiver, mode, None)
            .await?
        {
            return Ok(());
        }

        let result = self.start_receive(source_agent_id, mode).await;
        if let Err(e) = &result {
            self.report_status(TransferStatus::TransferFailed, None, Some(&e.to_string()));
            self.discard().await;
        }
        result
    }

    async fn start_receive(&self, source_agent_id: &str, mode: TransferMode) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix("transfer_")
            .suffix(".tar")
            .tempfile()
            .map_err(|e| Error::transfer(format!("failed to create temp file: {}", e)))?;
        let temp_path = temp.path().to_path_buf();
        info!(
            source = %source_agent_id,
            temp = %temp_path.display(),
            mode = ?mode,
            "Receiving transfer"
        );

        let writer = match mode {
            TransferMode::Relay => {
                let (tx, mut rx) = mpsc::channel::<Bytes>(64);
                self.session.install_chunk_sink(tx);
                tokio::spawn(async move {
                    let mut file = tokio::fs::OpenOptions::new()
                        .write(true)
                        .open(&temp_path)
                        .await?;
                    let mut chunks: u64 = 0;
                    let mut total: u64 = 0;
                    while let Some(chunk) = rx.recv().await {
                        file.write_all(&chunk).await?;
                        chunks += 1;
                        total += chunk.len() as u64;
                        if chunks == 1 || chunks % 100 == 0 {
                            debug!(chunk = chunks, total_bytes = total, "Receiving relay chunks");
                        }
                    }
                    file.flush().await?;
                    Ok::<_, std::io::Error>((chunks, total))
                })
            }
            TransferMode::P2p => {
                // Let file handles settle before the socket drains into it.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                let (_cid, mut stream) = self
                    .link
                    .take_stream(source_agent_id)
                    .await
                    .ok_or_else(|| {
                        Error::transfer("direct connection not available for receiving")
                    })?;
                tokio::spawn(async move {
                    let mut file = tokio::fs::OpenOptions::new()
                        .write(true)
                        .open(&temp_path)
                        .await?;
                    let total = tokio::io::copy(&mut stream, &mut file).await?;
                    file.flush().await?;
                    Ok::<_, std::io::Error>((1, total))
                })
            }
        };

        let mut guard = self.active.lock().await;
        if let Some(ctx) = guard.as_mut() {
            ctx.temp = Some(temp);
            ctx.writer = Some(writer);
        }
        Ok(())
    }

    /// Close out the in-flight receive: drain the writer, extract, clean up.
    pub async fn complete(&self) -> Result<()> {
        let ctx = self
            .active
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::transfer("no active transfer to complete"))?;

        self.session.clear_chunk_sink();

        let result = self.finish_receive(ctx).await;
        if let Err(e) = &result {
            self.report_status(TransferStatus::TransferFailed, None, Some(&e.to_string()));
        }
        result
    }

    async fn finish_receive(&self, mut ctx: TransferContext) -> Result<()> {
        if ctx.role != TransferRole::Receiver {
            return Err(Error::transfer("active transfer is not receiving"));
        }

        if let Some(writer) = ctx.writer.take() {
            let (chunks, bytes) = writer
                .await
                .map_err(|e| Error::transfer(format!("writer task failed: {}", e)))?
                .map_err(|e| Error::transfer(format!("failed writing temp file: {}", e)))?;
            info!(chunks, bytes, "Transfer stream drained");
        }

        let temp = ctx
            .temp
            .take()
            .ok_or_else(|| Error::transfer("no temp file for transfer"))?;
        let extract_root = self.config.transfers_dir(&ctx.peer_id);
        let tar_path = temp.path().to_path_buf();

        let summary = tokio::task::spawn_blocking(move || {
            extract_archive(&tar_path, &extract_root)
        })
        .await
        .map_err(|e| Error::transfer(format!("extract task failed: {}", e)))??;

        // Partial extractions on error are preserved for inspection; the
        // temp archive itself is always removed.
        if let Err(e) = temp.close() {
            warn!(error = %e, "Failed to remove temp file");
        }

        info!(
            source = %ctx.peer_id,
            mode = ?ctx.mode,
            connection_id = ctx.connection_id.as_deref().unwrap_or("-"),
            files = summary.files,
            dirs = summary.dirs,
            skipped = summary.skipped,
            "Transfer completed and extracted"
        );
        Ok(())
    }

    // =========================================================================
    // Failure paths
    // =========================================================================

    /// Abort the in-flight transfer (peer reported failure).
    pub async fn abort(&self, reason: Option<String>) {
        if self.discard().await {
            warn!(reason = reason.as_deref().unwrap_or("unknown"), "Transfer aborted");
        }
    }

    /// Best-effort cleanup when the session dies mid-transfer.
    pub async fn teardown(&self) {
        let had_active = {
            let guard = self.active.lock().await;
            guard.is_some()
        };
        if had_active {
            self.report_status(TransferStatus::TransferFailed, None, Some("session lost"));
        }
        self.discard().await;
        self.link.close(None).await;
    }

    /// Drop the active context and its resources. Returns whether one existed.
    async fn discard(&self) -> bool {
        let ctx = self.active.lock().await.take();
        self.session.clear_chunk_sink();
        match ctx {
            Some(ctx) => {
                if let Some(writer) = &ctx.writer {
                    writer.abort();
                }
                // Temp file unlinks on drop.
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Context guard
    // =========================================================================

    /// Claim the single transfer slot.
    ///
    /// Returns Ok(false) when the same transfer is already active (the
    /// prepare raced a second trigger); errors when a different transfer
    /// holds the slot.
    async fn begin(
        &self,
        peer_id: &str,
        role: TransferRole,
        mode: TransferMode,
        connection_id: Option<String>,
    ) -> Result<bool> {
        let mut guard = self.active.lock().await;
        match guard.as_ref() {
            None => {
                *guard = Some(TransferContext {
                    peer_id: peer_id.to_string(),
                    role,
                    mode,
                    connection_id,
                    temp: None,
                    writer: None,
                });
                Ok(true)
            }
            Some(existing) if existing.peer_id == peer_id && existing.role == role => {
                debug!(peer = %peer_id, "Transfer already active for this peer, ignoring");
                Ok(false)
            }
            Some(existing) => {
                error!(
                    active_peer = %existing.peer_id,
                    requested_peer = %peer_id,
                    "Rejecting transfer: another transfer is in progress"
                );
                Err(Error::transfer(TRANSFER_BUSY))
            }
        }
    }

    async fn end(&self) {
        self.active.lock().await.take();
    }

    fn report_status(
        &self,
        status: TransferStatus,
        connection_id: Option<&str>,
        reason: Option<&str>,
    ) {
        let mut update = TransferStatusUpdate::report(status, self.session.agent_id());
        if let Some(cid) = connection_id {
            update = update.with_connection_id(cid);
        }
        if let Some(reason) = reason {
            update = update.with_reason(reason);
        }
        if let Err(e) = self.session.send(Frame::MasterTransferStatus(update)) {
            debug!(error = %e, "Status report not sent");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nebula_core::AgentIdentity;
    use nebula_core::protocol::Outbound;

    use super::*;

    fn manager(shared: PathBuf) -> (Arc<TransferManager>, mpsc::Receiver<Outbound>) {
        let (session, outbound_rx, _tx) =
            Session::detached(AgentIdentity::from_parts("agent-recv", "recv", "Linux"));
        let config = Arc::new(AgentConfig::for_tests("http://m", shared));
        (TransferManager::new(session, config), outbound_rx)
    }

    async fn next_status(rx: &mut mpsc::Receiver<Outbound>) -> TransferStatusUpdate {
        loop {
            match rx.recv().await.expect("outbound closed") {
                Outbound::Frame(Frame::MasterTransferStatus(update)) => return update,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn second_transfer_is_rejected_while_one_is_active() {
        let shared = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(shared.path().to_path_buf());

        manager.receive("peer-a", TransferMode::Relay).await.unwrap();
        let err = manager
            .receive("peer-b", TransferMode::Relay)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));

        // Same peer, same role: tolerated as a duplicate trigger.
        manager.receive("peer-a", TransferMode::Relay).await.unwrap();
    }

    #[tokio::test]
    async fn relay_receive_writes_chunks_and_extracts() {
        let shared = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(shared.path().to_path_buf());

        // Build a small archive in memory.
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), b"hello relay").unwrap();
        let mut archive = stream_path(src.path().to_path_buf());

        manager.receive("peer-src", TransferMode::Relay).await.unwrap();

        // Feed the archive through the installed chunk sink, as the
        // session processor would.
        let sink = manager.session.chunk_sink().expect("sink installed");
        while let Some(chunk) = archive.data.recv().await {
            sink.send(chunk).await.unwrap();
        }
        drop(sink);

        manager.complete().await.unwrap();

        let extracted = shared
            .path()
            .join("transfers")
            .join("peer-src")
            .join("hello.txt");
        assert_eq!(std::fs::read(extracted).unwrap(), b"hello relay");
    }

    #[tokio::test]
    async fn complete_without_transfer_is_an_error() {
        let shared = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(shared.path().to_path_buf());
        let err = manager.complete().await.unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));
    }

    #[tokio::test]
    async fn relay_send_reports_initiated_then_completed() {
        let shared = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(shared.path().join("docs")).unwrap();
        std::fs::write(shared.path().join("docs/a.txt"), b"payload").unwrap();

        let (manager, mut rx) = manager(shared.path().to_path_buf());
        manager
            .send("docs", "peer-dst", TransferMode::Relay, Some("c-1".into()))
            .await
            .unwrap();

        let first = next_status(&mut rx).await;
        assert_eq!(first.status, TransferStatus::Initiated);
        assert_eq!(first.connection_id.as_deref(), Some("c-1"));

        // Binary chunks flow between the two status frames.
        let mut saw_binary = false;
        loop {
            match rx.recv().await.unwrap() {
                Outbound::Binary(_) => saw_binary = true,
                Outbound::Frame(Frame::MasterTransferStatus(update))
                    if update.status == TransferStatus::Completed =>
                {
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_binary);
    }

    #[tokio::test]
    async fn relay_send_of_bad_path_reports_failure() {
        let shared = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(shared.path().to_path_buf());

        let err = manager
            .send("../escape", "peer-dst", TransferMode::Relay, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));

        let update = next_status(&mut rx).await;
        assert_eq!(update.status, TransferStatus::TransferFailed);
        assert!(update.reason.is_some());
    }

    #[tokio::test]
    async fn direct_send_without_link_reports_failure() {
        let shared = tempfile::tempdir().unwrap();
        std::fs::write(shared.path().join("f.txt"), b"x").unwrap();
        let (manager, mut rx) = manager(shared.path().to_path_buf());

        let err = manager
            .send("f.txt", "peer-dst", TransferMode::P2p, Some("c-2".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));

        let update = next_status(&mut rx).await;
        assert_eq!(update.status, TransferStatus::TransferFailed);
    }

    #[tokio::test]
    async fn teardown_reports_failure_and_clears_slot() {
        let shared = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(shared.path().to_path_buf());

        manager.receive("peer-a", TransferMode::Relay).await.unwrap();
        manager.teardown().await;

        let update = next_status(&mut rx).await;
        assert_eq!(update.status, TransferStatus::TransferFailed);
        assert_eq!(update.reason.as_deref(), Some("session lost"));

        // Slot is free again.
        manager.receive("peer-b", TransferMode::Relay).await.unwrap();
    }
}
