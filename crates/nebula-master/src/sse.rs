//! Broadcast sink for the browser event stream.
//!
//! Every processed agent frame (and synthetic events like
//! `agent_disconnected`) is fanned out to SSE subscribers. Slow or absent
//! subscribers never block the hub: the channel drops the oldest events.

use tokio::sync::broadcast;
use tracing::debug;

use nebula_core::protocol::Frame;

const SSE_BUFFER: usize = 256;

/// Fan-out of pre-serialized JSON events.
#[derive(Clone)]
pub struct SseHub {
    tx: broadcast::Sender<String>,
}

impl SseHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SSE_BUFFER);
        Self { tx }
    }

    /// Subscribe a new event-stream consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Broadcast a control-plane frame.
    pub fn broadcast_frame(&self, frame: &Frame) {
        match frame.encode() {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => debug!(error = %e, "Frame not broadcast"),
        }
    }

    /// Broadcast a synthetic event.
    pub fn broadcast_json(&self, value: serde_json::Value) {
        let _ = self.tx.send(value.to_string());
    }

    /// Current subscriber count.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let sse = SseHub::new();
        let mut rx = sse.subscribe();

        sse.broadcast_frame(&Frame::MasterMetricsRequest);
        let event = rx.recv().await.unwrap();
        assert!(event.contains("master_metrics_request"));

        sse.broadcast_json(serde_json::json!({"type": "agent_disconnected"}));
        let event = rx.recv().await.unwrap();
        assert!(event.contains("agent_disconnected"));
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_fine() {
        let sse = SseHub::new();
        sse.broadcast_frame(&Frame::MasterRestartRequest);
        assert_eq!(sse.receiver_count(), 0);
    }
}
