//! Public endpoint discovery.
//!
//! The rendezvous needs each agent's externally reachable `host:port`.
//! Discovery itself (STUN, static config, orchestrator metadata) is an
//! external collaborator; any mechanism that yields an endpoint works.
//! The agent just reports whatever the provider hands it inside
//! `agent_metrics`, and the master skips straight to relay when a side
//! has none.

/// Supplier of this agent's public endpoint.
pub trait EndpointProvider: Send + Sync {
    /// Current `host:port`, if known.
    fn public_endpoint(&self) -> Option<String>;
}

/// Provider reading the `PUBLIC_ENDPOINT` environment variable once.
pub struct EnvEndpointProvider {
    endpoint: Option<String>,
}

impl EnvEndpointProvider {
    pub fn from_env() -> Self {
        let endpoint = std::env::var("PUBLIC_ENDPOINT")
            .ok()
            .filter(|v| looks_like_endpoint(v));
        Self { endpoint }
    }

    pub fn fixed(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn none() -> Self {
        Self { endpoint: None }
    }
}

impl EndpointProvider for EnvEndpointProvider {
    fn public_endpoint(&self) -> Option<String> {
        self.endpoint.clone()
    }
}

fn looks_like_endpoint(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_endpoint_is_reported() {
        let provider = EnvEndpointProvider::fixed("198.51.100.7:40112");
        assert_eq!(
            provider.public_endpoint().as_deref(),
            Some("198.51.100.7:40112")
        );
    }

    #[test]
    fn absent_endpoint_is_none() {
        assert!(EnvEndpointProvider::none().public_endpoint().is_none());
    }

    #[test]
    fn endpoint_shape_validation() {
        assert!(looks_like_endpoint("10.0.0.1:4000"));
        assert!(looks_like_endpoint("host.example:1"));
        assert!(!looks_like_endpoint("no-port"));
        assert!(!looks_like_endpoint(":4000"));
        assert!(!looks_like_endpoint("host:notaport"));
    }
}
