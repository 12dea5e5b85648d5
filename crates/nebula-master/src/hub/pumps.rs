//! Per-connection worker loops.
//!
//! Four workers per socket: reader, writer, processor and the
//! stream-forwarder that implements the relay data path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nebula_core::constants::{
    MAX_BINARY_FRAME, PING_PERIOD, PONG_WAIT, STREAM_ENQUEUE_TIMEOUT, WRITE_WAIT,
};
use nebula_core::protocol::{Frame, Outbound};

use super::{Connection, Hub};

#[allow(clippy::too_many_arguments)]
pub(super) fn start(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    socket: WebSocket,
    cancel: CancellationToken,
    send_rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: mpsc::Receiver<Frame>,
    stream_tx: mpsc::Sender<Bytes>,
    stream_rx: mpsc::Receiver<Bytes>,
) -> Vec<JoinHandle<()>> {
    let (ws_tx, ws_rx) = socket.split();
    vec![
        tokio::spawn(reader(
            Arc::clone(&conn),
            ws_rx,
            inbound_tx,
            stream_tx,
            cancel.clone(),
        )),
        tokio::spawn(writer(Arc::clone(&conn), ws_tx, send_rx, cancel.clone())),
        tokio::spawn(processor(
            Arc::clone(&hub),
            Arc::clone(&conn),
            inbound_rx,
            cancel.clone(),
        )),
        tokio::spawn(forwarder(hub, conn, stream_rx, cancel)),
    ]
}

/// Socket → inbound/stream queues.
async fn reader(
    conn: Arc<Connection>,
    mut ws_rx: SplitStream<WebSocket>,
    inbound_tx: mpsc::Sender<Frame>,
    stream_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(PONG_WAIT, ws_rx.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!(agent_id = %conn.id, "No traffic within deadline, dropping connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(agent_id = %conn.id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(raw) => {
                conn.touch();
                match Frame::decode(&raw) {
                    Ok(frame) => {
                        if inbound_tx.try_send(frame).is_err() {
                            warn!(agent_id = %conn.id, "Inbound queue full, dropping frame");
                        }
                    }
                    Err(e) => {
                        warn!(agent_id = %conn.id, error = %e, "Dropping undecodable frame")
                    }
                }
            }
            Message::Binary(chunk) => {
                if chunk.len() > MAX_BINARY_FRAME {
                    warn!(
                        agent_id = %conn.id,
                        size = chunk.len(),
                        "Oversized binary frame, dropping"
                    );
                    continue;
                }
                // Bounded patience, then the connection is considered
                // wedged and dropped.
                match timeout(STREAM_ENQUEUE_TIMEOUT, stream_tx.send(Bytes::from(chunk))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(
                            agent_id = %conn.id,
                            "Stream queue blocked too long, dropping connection"
                        );
                        break;
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => conn.touch(),
            Message::Close(_) => break,
        }
    }
    cancel.cancel();
    debug!(agent_id = %conn.id, "Read pump stopped");
}

/// Send queue → socket, with the periodic health ping.
async fn writer(
    conn: Arc<Connection>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // the immediate first tick

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = timeout(WRITE_WAIT, ws_tx.send(Message::Close(None))).await;
                break;
            }
            out = send_rx.recv() => match out {
                None => break,
                Some(Outbound::Frame(frame)) => match frame.encode() {
                    Ok(raw) => Message::Text(raw),
                    Err(e) => {
                        warn!(agent_id = %conn.id, error = %e, "Failed to encode frame");
                        continue;
                    }
                },
                Some(Outbound::Binary(chunk)) => Message::Binary(chunk.to_vec()),
                Some(Outbound::Pong(payload)) => Message::Pong(payload.to_vec()),
                Some(Outbound::Ping(payload)) => Message::Ping(payload.to_vec()),
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(WRITE_WAIT, ws_tx.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(agent_id = %conn.id, error = %e, "WebSocket write error");
                break;
            }
            Err(_) => {
                warn!(agent_id = %conn.id, "WebSocket write timed out");
                break;
            }
        }
    }
    cancel.cancel();
    debug!(agent_id = %conn.id, "Write pump stopped");
}

/// Inbound queue → handlers and the frontend broadcast.
async fn processor(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    mut inbound_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        hub.sse().broadcast_frame(&frame);
        hub.dispatch(frame, &conn);
    }
    debug!(agent_id = %conn.id, "Processor pump stopped");
}

/// Stream queue → the relay target's send queue.
async fn forwarder(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    mut stream_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stream_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        hub.forward_chunk(&conn, chunk);
    }
    debug!(agent_id = %conn.id, "Stream forwarder stopped");
}
