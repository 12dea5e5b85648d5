//! Agent configuration from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use nebula_core::constants::{DEFAULT_HEARTBEAT_SECS, SHARED_FOLDER_NAME, TRANSFERS_DIR};
use nebula_core::{Error, Result};

/// Immutable agent configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    master_url: String,
    service_name: String,
    service_display_name: String,
    service_description: String,
    heartbeat_timer: Duration,
    shared_folder: PathBuf,
}

impl AgentConfig {
    /// Resolve configuration from the environment.
    ///
    /// `MASTER_URL` is required; a missing value is a fatal configuration
    /// error. Everything else has defaults.
    pub fn from_env() -> Result<Self> {
        let master_url = std::env::var("MASTER_URL").map_err(|_| Error::Config {
            message: "MASTER_URL is not set".into(),
        })?;
        if master_url.is_empty() {
            return Err(Error::Config {
                message: "MASTER_URL is empty".into(),
            });
        }

        let heartbeat_secs = std::env::var("HEARTBEAT_TIMER")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);

        Ok(Self {
            master_url,
            service_name: env_or("SERVICE_NAME", "nebulalink-agent"),
            service_display_name: env_or("SERVICE_DISPLAY_NAME", "NebulaLink Agent"),
            service_description: env_or(
                "SERVICE_DESCRIPTION",
                "NebulaLink fleet agent: metrics, lifecycle and directory transfer",
            ),
            heartbeat_timer: Duration::from_secs(heartbeat_secs),
            shared_folder: default_shared_folder()?,
        })
    }

    /// Build a config directly (tests).
    pub fn for_tests(master_url: impl Into<String>, shared_folder: PathBuf) -> Self {
        Self {
            master_url: master_url.into(),
            service_name: "nebulalink-agent".into(),
            service_display_name: "NebulaLink Agent".into(),
            service_description: "test agent".into(),
            heartbeat_timer: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            shared_folder,
        }
    }

    pub fn master_url(&self) -> &str {
        &self.master_url
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_display_name(&self) -> &str {
        &self.service_display_name
    }

    pub fn service_description(&self) -> &str {
        &self.service_description
    }

    pub fn heartbeat_timer(&self) -> Duration {
        self.heartbeat_timer
    }

    /// Root of the shared folder (`<home>/Desktop/NebulaLink-shared`).
    pub fn shared_folder(&self) -> &PathBuf {
        &self.shared_folder
    }

    /// Extraction root for transfers arriving from `source_agent_id`.
    pub fn transfers_dir(&self, source_agent_id: &str) -> PathBuf {
        self.shared_folder.join(TRANSFERS_DIR).join(source_agent_id)
    }

    /// Resolve a server-relative transfer path inside the shared folder.
    ///
    /// Rejects anything that would land outside the shared folder.
    pub fn resolve_shared_path(&self, rel: &str) -> Result<PathBuf> {
        let cleaned = nebula_core::archive::sanitize_entry_name(rel)
            .ok_or_else(|| Error::transfer(format!("invalid transfer path: {:?}", rel)))?;
        Ok(self.shared_folder.join(cleaned))
    }

    /// Control-plane URL for this agent's identity.
    ///
    /// `http` rewrites to `ws` and `https` to `wss`; query parameters carry
    /// the identity triple.
    pub fn ws_url(&self, id: &str, name: &str, os: &str) -> String {
        let base = if let Some(rest) = self.master_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.master_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.master_url.clone()
        };
        format!(
            "{}/ws?name={}&id={}&os={}",
            base.trim_end_matches('/'),
            urlencode(name),
            urlencode(id),
            urlencode(os)
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn default_shared_folder() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| Error::Config {
        message: "could not determine user home directory".into(),
    })?;
    Ok(home.join("Desktop").join(SHARED_FOLDER_NAME))
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    }
    #[cfg(not(windows))]
    {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

/// Minimal percent-encoding for query values (identity fields only hold
/// hostname-ish characters, but spaces in agent names must survive).
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                use std::fmt::Write;
                let _ = write!(out, "%{:02X}", b);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(url: &str) -> AgentConfig {
        AgentConfig::for_tests(url, PathBuf::from("/tmp/shared"))
    }

    #[test]
    fn ws_url_rewrites_http_scheme() {
        let cfg = test_config("http://master.example:8080");
        assert_eq!(
            cfg.ws_url("id1", "agent one", "Linux"),
            "ws://master.example:8080/ws?name=agent%20one&id=id1&os=Linux"
        );
    }

    #[test]
    fn ws_url_rewrites_https_scheme() {
        let cfg = test_config("https://master.example");
        assert!(
            cfg.ws_url("i", "n", "o").starts_with("wss://master.example/ws?")
        );
    }

    #[test]
    fn ws_url_tolerates_trailing_slash() {
        let cfg = test_config("http://master.example/");
        assert_eq!(
            cfg.ws_url("i", "n", "Linux"),
            "ws://master.example/ws?name=n&id=i&os=Linux"
        );
    }

    #[test]
    fn transfers_dir_is_scoped_per_source() {
        let cfg = test_config("http://m");
        assert_eq!(
            cfg.transfers_dir("agent-9"),
            PathBuf::from("/tmp/shared/transfers/agent-9")
        );
    }

    #[test]
    fn resolve_shared_path_accepts_relative() {
        let cfg = test_config("http://m");
        assert_eq!(
            cfg.resolve_shared_path("docs/report").unwrap(),
            PathBuf::from("/tmp/shared/docs/report")
        );
    }

    #[test]
    fn resolve_shared_path_rejects_escape() {
        let cfg = test_config("http://m");
        assert!(cfg.resolve_shared_path("../outside").is_err());
        assert!(cfg.resolve_shared_path(".").is_err());
        assert!(cfg.resolve_shared_path("").is_err());
    }

    #[test]
    fn resolve_shared_path_strips_absolute() {
        let cfg = test_config("http://m");
        assert_eq!(
            cfg.resolve_shared_path("/docs").unwrap(),
            PathBuf::from("/tmp/shared/docs")
        );
    }
}
