//! Session worker loops.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use nebula_core::constants::{PONG_WAIT, WRITE_WAIT};
use nebula_core::protocol::{Frame, Outbound};

use super::{Inbound, Session};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawn the reader, writer and processor workers for a fresh socket.
pub(super) fn start(
    session: Arc<Session>,
    socket: WsStream,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
) {
    let (sink, stream) = socket.split();
    tokio::spawn(reader(Arc::clone(&session), stream, inbound_tx));
    tokio::spawn(writer(Arc::clone(&session), sink, outbound_rx));
    tokio::spawn(processor(session, inbound_rx));
}

/// Socket → inbound queue. Enforces the ping deadline: any 60s window
/// without traffic tears the session down.
async fn reader(
    session: Arc<Session>,
    mut stream: SplitStream<WsStream>,
    inbound_tx: mpsc::Sender<Inbound>,
) {
    let cancel = session.cancel_token();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(PONG_WAIT, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!("No ping from master within deadline, closing session");
                session.close();
                break;
            }
            Ok(None) => {
                info!("Master closed the connection");
                session.close();
                break;
            }
            Ok(Some(Err(e))) => {
                error!(error = %e, "WebSocket read error");
                session.close();
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(raw) => match Frame::decode(&raw) {
                Ok(frame) => {
                    if inbound_tx.try_send(Inbound::Frame(frame)).is_err() {
                        warn!("Inbound queue full, dropping text frame");
                    }
                }
                Err(e) => warn!(error = %e, "Dropping undecodable text frame"),
            },
            Message::Binary(chunk) => {
                if inbound_tx
                    .try_send(Inbound::Binary(Bytes::from(chunk)))
                    .is_err()
                {
                    warn!("Inbound queue full, dropping binary chunk");
                }
            }
            Message::Ping(payload) => {
                // Echo the payload back, per the health contract.
                let _ = session.send(Outbound::Pong(Bytes::from(payload)));
            }
            Message::Pong(_) => {}
            Message::Close(_) => {
                info!("Received close frame from master");
                session.close();
                break;
            }
            Message::Frame(_) => {}
        }
    }
    debug!("Read pump stopped");
}

/// Send queue → socket. A write failure tears the session down; on
/// cancellation a close frame goes out best-effort.
async fn writer(
    session: Arc<Session>,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    let cancel = session.cancel_token();
    loop {
        let out = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                break;
            }
            out = outbound_rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        let msg = match out {
            Outbound::Frame(frame) => match frame.encode() {
                Ok(raw) => Message::Text(raw),
                Err(e) => {
                    error!(error = %e, "Failed to encode frame");
                    continue;
                }
            },
            Outbound::Binary(chunk) => Message::Binary(chunk.to_vec()),
            Outbound::Pong(payload) => Message::Pong(payload.to_vec()),
            Outbound::Ping(payload) => Message::Ping(payload.to_vec()),
        };

        match timeout(WRITE_WAIT, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "WebSocket write error");
                session.close();
                break;
            }
            Err(_) => {
                error!("WebSocket write timed out");
                session.close();
                break;
            }
        }
    }
    debug!("Write pump stopped");
}

/// Inbound queue → typed handlers, plus the binary chunk sink.
async fn processor(session: Arc<Session>, mut inbound_rx: mpsc::Receiver<Inbound>) {
    let cancel = session.cancel_token();
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = inbound_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        match inbound {
            Inbound::Frame(frame) => session.dispatch(frame),
            Inbound::Binary(chunk) => {
                session.take_chunk_sink_if_closed();
                match session.chunk_sink() {
                    Some(sink) => {
                        // Awaiting here applies backpressure to the inbound
                        // queue rather than reordering or dropping chunks.
                        if sink.send(chunk).await.is_err() {
                            warn!("Chunk sink closed mid-transfer, dropping chunk");
                            session.clear_chunk_sink();
                        }
                    }
                    None => {
                        warn!(size = chunk.len(), "Binary chunk with no receiver, dropping");
                    }
                }
            }
        }
    }
    debug!("Processor pump stopped");
}
