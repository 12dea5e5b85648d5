//! Payloads originated by the master.

use serde::{Deserialize, Serialize};

use super::status::TransferMode;

/// `master_transfer_intent` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub requesting_agent_id: String,
    pub source_agent_id: String,
    /// Path relative to the source agent's shared folder.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

/// `master_p2p_initiate` payload: one synchronized-dial attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2pInitiate {
    pub connection_id: String,
    /// The other party of the rendezvous.
    pub target_agent_id: String,
    /// The other party's reported `host:port`.
    pub target_endpoint: String,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub countdown_seconds: u64,
}

/// `master_p2p_transfer_start` / `master_relay_transfer_start` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStart {
    pub requesting_agent_id: String,
    pub path: String,
    pub connection_id: String,
    pub transfer_mode: TransferMode,
}

/// Role assignment carried by a relay fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    Send,
    Receive,
}

/// `master_relay_fallback` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFallback {
    pub connection_id: String,
    pub requesting_agent_id: String,
    pub source_agent_id: String,
    pub transfer_mode: TransferMode,
    pub fallback: bool,
    pub action: FallbackAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&FallbackAction::Send).unwrap(),
            r#""send""#
        );
        assert_eq!(
            serde_json::to_string(&FallbackAction::Receive).unwrap(),
            r#""receive""#
        );
    }

    #[test]
    fn transfer_start_round_trips() {
        let start = TransferStart {
            requesting_agent_id: "a1".into(),
            path: "dir/sub".into(),
            connection_id: "c-9".into(),
            transfer_mode: TransferMode::Relay,
        };
        let json = serde_json::to_string(&start).unwrap();
        assert!(json.contains(r#""transfer_mode":"relay""#));
        assert_eq!(
            serde_json::from_str::<TransferStart>(&json).unwrap(),
            start
        );
    }
}
