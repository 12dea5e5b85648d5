//! OS service lifecycle management.
//!
//! The agent installs itself as a managed service so it survives reboots
//! and can be restarted or removed by the master. Each platform drives
//! its init system through its native tool: systemd on Linux, launchd on
//! macOS, the service control manager on Windows. Installation also
//! creates the shared folder.

mod systemd;

#[cfg(target_os = "macos")]
mod launchd;
#[cfg(windows)]
mod windows;

use async_trait::async_trait;
use tracing::info;

use nebula_core::Result;

use crate::config::AgentConfig;

/// Controls the agent's OS service registration.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Register the service, enable auto-start and a restart policy, and
    /// create the shared folder. Installing twice is a no-op.
    async fn install(&self) -> Result<()>;

    /// Stop and remove the service registration.
    async fn uninstall(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;
}

/// Build the controller for the current platform.
pub fn platform_controller(config: &AgentConfig, agent_name: &str) -> Box<dyn ServiceController> {
    #[cfg(target_os = "macos")]
    {
        return Box::new(launchd::LaunchdController::new(config, agent_name));
    }
    #[cfg(windows)]
    {
        return Box::new(windows::ScmController::new(config, agent_name));
    }
    #[cfg(not(any(target_os = "macos", windows)))]
    {
        Box::new(systemd::SystemdController::new(config, agent_name))
    }
}

/// Create the shared folder (and its transfers subdirectory) if absent.
pub(crate) fn ensure_shared_folder(config: &AgentConfig) -> Result<()> {
    let shared = config.shared_folder();
    std::fs::create_dir_all(shared.join(nebula_core::constants::TRANSFERS_DIR))?;
    info!(path = %shared.display(), "Shared folder ready");
    Ok(())
}

/// Run a system command, mapping non-zero exit into a service error.
pub(crate) async fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| nebula_core::Error::Service {
            message: format!("failed to run {}: {}", program, e),
        })?;
    if !output.status.success() {
        return Err(nebula_core::Error::Service {
            message: format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn ensure_shared_folder_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::for_tests("http://m", dir.path().join("shared"));

        ensure_shared_folder(&cfg).unwrap();
        ensure_shared_folder(&cfg).unwrap();
        assert!(dir.path().join("shared/transfers").is_dir());
    }

    #[test]
    fn platform_controller_builds() {
        let cfg = AgentConfig::for_tests("http://m", PathBuf::from("/tmp/s"));
        let _controller = platform_controller(&cfg, "agent-01");
    }
}
