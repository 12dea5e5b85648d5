//! systemd-backed service controller (Linux and other systemd hosts).

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use nebula_core::{Error, Result};

use crate::config::AgentConfig;

use super::{ServiceController, ensure_shared_folder, run_checked};

pub struct SystemdController {
    config: AgentConfig,
    agent_name: String,
    unit_dir: PathBuf,
}

impl SystemdController {
    pub fn new(config: &AgentConfig, agent_name: &str) -> Self {
        Self {
            config: config.clone(),
            agent_name: agent_name.to_string(),
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }

    #[cfg(test)]
    fn with_unit_dir(mut self, dir: PathBuf) -> Self {
        self.unit_dir = dir;
        self
    }

    fn unit_name(&self) -> String {
        format!("{}.service", self.config.service_name())
    }

    fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    fn unit_contents(&self) -> Result<String> {
        let exe = std::env::current_exe().map_err(|e| Error::Service {
            message: format!("cannot resolve agent binary path: {}", e),
        })?;
        Ok(format!(
            "[Unit]\n\
             Description={description}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             ExecStart={exe} {agent_name}\n\
             Restart=always\n\
             RestartSec=5\n\
             Environment=MASTER_URL={master_url}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            description = self.config.service_description(),
            exe = exe.display(),
            agent_name = self.agent_name,
            master_url = self.config.master_url(),
        ))
    }
}

#[async_trait]
impl ServiceController for SystemdController {
    async fn install(&self) -> Result<()> {
        ensure_shared_folder(&self.config)?;

        let path = self.unit_path();
        let contents = self.unit_contents()?;
        if std::fs::read_to_string(&path).map(|c| c == contents).unwrap_or(false) {
            info!(unit = %path.display(), "Service already installed");
            return Ok(());
        }

        std::fs::write(&path, contents).map_err(|e| Error::Service {
            message: format!("cannot write {}: {}", path.display(), e),
        })?;
        run_checked("systemctl", &["daemon-reload"]).await?;
        run_checked("systemctl", &["enable", &self.unit_name()]).await?;
        info!(unit = %path.display(), "Service installed");
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let unit = self.unit_name();
        // Stop/disable tolerate an already-removed unit.
        let _ = run_checked("systemctl", &["stop", &unit]).await;
        let _ = run_checked("systemctl", &["disable", &unit]).await;
        match std::fs::remove_file(self.unit_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Service {
                    message: format!("cannot remove unit file: {}", e),
                });
            }
        }
        run_checked("systemctl", &["daemon-reload"]).await?;
        info!(unit = %unit, "Service uninstalled");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        run_checked("systemctl", &["start", &self.unit_name()]).await
    }

    async fn stop(&self) -> Result<()> {
        run_checked("systemctl", &["stop", &self.unit_name()]).await
    }

    async fn restart(&self) -> Result<()> {
        run_checked("systemctl", &["restart", &self.unit_name()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_contents_reference_binary_and_master() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::for_tests("http://master:9000", dir.path().to_path_buf());
        let controller =
            SystemdController::new(&cfg, "branch-01").with_unit_dir(dir.path().to_path_buf());

        let unit = controller.unit_contents().unwrap();
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("branch-01"));
        assert!(unit.contains("MASTER_URL=http://master:9000"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn unit_path_uses_service_name() {
        let cfg = AgentConfig::for_tests("http://m", PathBuf::from("/tmp/s"));
        let controller = SystemdController::new(&cfg, "a");
        assert!(
            controller
                .unit_path()
                .to_string_lossy()
                .ends_with("nebulalink-agent.service")
        );
    }
}
