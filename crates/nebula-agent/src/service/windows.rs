//! Service Control Manager-backed controller (Windows).

use async_trait::async_trait;
use tracing::info;

use nebula_core::{Error, Result};

use crate::config::AgentConfig;

use super::{ServiceController, ensure_shared_folder, run_checked};

pub struct ScmController {
    config: AgentConfig,
    agent_name: String,
}

impl ScmController {
    pub fn new(config: &AgentConfig, agent_name: &str) -> Self {
        Self {
            config: config.clone(),
            agent_name: agent_name.to_string(),
        }
    }

    fn service_name(&self) -> &str {
        self.config.service_name()
    }
}

#[async_trait]
impl ServiceController for ScmController {
    async fn install(&self) -> Result<()> {
        ensure_shared_folder(&self.config)?;

        let exe = std::env::current_exe().map_err(|e| Error::Service {
            message: format!("cannot resolve agent binary path: {}", e),
        })?;
        let bin_path = format!("\"{}\" {}", exe.display(), self.agent_name);

        // `sc query` succeeding means the service already exists.
        if run_checked("sc.exe", &["query", self.service_name()]).await.is_ok() {
            info!(service = self.service_name(), "Service already installed");
            return Ok(());
        }

        run_checked(
            "sc.exe",
            &[
                "create",
                self.service_name(),
                &format!("binPath={}", bin_path),
                "start=auto",
                &format!("DisplayName={}", self.config.service_display_name()),
            ],
        )
        .await?;
        run_checked(
            "sc.exe",
            &["failure", self.service_name(), "reset=86400", "actions=restart/5000"],
        )
        .await?;
        info!(service = self.service_name(), "Service installed");
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let _ = run_checked("sc.exe", &["stop", self.service_name()]).await;
        run_checked("sc.exe", &["delete", self.service_name()]).await
    }

    async fn start(&self) -> Result<()> {
        run_checked("sc.exe", &["start", self.service_name()]).await
    }

    async fn stop(&self) -> Result<()> {
        run_checked("sc.exe", &["stop", self.service_name()]).await
    }

    async fn restart(&self) -> Result<()> {
        let _ = self.stop().await;
        self.start().await
    }
}
