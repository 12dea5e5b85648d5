//! Agent identity derivation.
//!
//! Every agent carries a stable, hardware-derived identifier: a SHA-256
//! digest over machine facts, hex-encoded. The same host always produces
//! the same id, so a reconnecting agent maps back onto its existing
//! registration in the master's hub.

use sha2::{Digest, Sha256};

/// Identity presented by an agent when dialing the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Stable hex-encoded 256-bit identifier.
    pub id: String,
    /// Human-readable name, chosen by the operator.
    pub name: String,
    /// OS tag reported to the master ("Linux", "macOS", "Windows", ...).
    pub os: String,
}

impl AgentIdentity {
    /// Derive an identity for this host with the given operator name.
    pub fn derive(name: impl Into<String>) -> Self {
        Self {
            id: machine_id(),
            name: name.into(),
            os: os_label().to_string(),
        }
    }

    /// Build an identity from known parts (tests, replay).
    pub fn from_parts(
        id: impl Into<String>,
        name: impl Into<String>,
        os: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            os: os.into(),
        }
    }
}

/// Stable machine identifier, hex-encoded SHA-256.
///
/// Prefers the OS machine-id file; falls back to the hostname. The digest
/// decouples the wire id from the raw fact, so the raw machine-id never
/// leaves the host.
fn machine_id() -> String {
    let fact = read_machine_fact();
    let mut hasher = Sha256::new();
    hasher.update(b"nebulalink-agent-v1:");
    hasher.update(fact.as_bytes());
    hex::encode(hasher.finalize())
}

fn read_machine_fact() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    hostname_fallback()
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Display label for the current OS, matching the master's expectations.
pub fn os_label() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macOS",
        "windows" => "Windows",
        "linux" => "Linux",
        other => {
            // Uncommon targets keep their raw name.
            Box::leak(other.to_string().into_boxed_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable() {
        assert_eq!(machine_id(), machine_id());
    }

    #[test]
    fn machine_id_is_256_bit_hex() {
        let id = machine_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derive_uses_operator_name() {
        let identity = AgentIdentity::derive("branch-agent-01");
        assert_eq!(identity.name, "branch-agent-01");
        assert!(!identity.id.is_empty());
        assert!(!identity.os.is_empty());
    }

    #[test]
    fn os_label_is_friendly() {
        let label = os_label();
        assert!(["Linux", "macOS", "Windows"].contains(&label) || !label.is_empty());
    }
}
