//! launchd-backed service controller (macOS).

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use nebula_core::{Error, Result};

use crate::config::AgentConfig;

use super::{ServiceController, ensure_shared_folder, run_checked};

pub struct LaunchdController {
    config: AgentConfig,
    agent_name: String,
}

impl LaunchdController {
    pub fn new(config: &AgentConfig, agent_name: &str) -> Self {
        Self {
            config: config.clone(),
            agent_name: agent_name.to_string(),
        }
    }

    fn label(&self) -> String {
        format!("com.nebulalink.{}", self.config.service_name())
    }

    fn plist_path(&self) -> PathBuf {
        PathBuf::from("/Library/LaunchDaemons").join(format!("{}.plist", self.label()))
    }

    fn plist_contents(&self) -> Result<String> {
        let exe = std::env::current_exe().map_err(|e| Error::Service {
            message: format!("cannot resolve agent binary path: {}", e),
        })?;
        Ok(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
        <string>{agent_name}</string>
    </array>
    <key>EnvironmentVariables</key>
    <dict>
        <key>MASTER_URL</key>
        <string>{master_url}</string>
    </dict>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
            label = self.label(),
            exe = exe.display(),
            agent_name = self.agent_name,
            master_url = self.config.master_url(),
        ))
    }
}

#[async_trait]
impl ServiceController for LaunchdController {
    async fn install(&self) -> Result<()> {
        ensure_shared_folder(&self.config)?;

        let path = self.plist_path();
        let contents = self.plist_contents()?;
        if std::fs::read_to_string(&path).map(|c| c == contents).unwrap_or(false) {
            info!(plist = %path.display(), "Service already installed");
            return Ok(());
        }

        std::fs::write(&path, contents).map_err(|e| Error::Service {
            message: format!("cannot write {}: {}", path.display(), e),
        })?;
        run_checked("launchctl", &["load", "-w", &path.to_string_lossy()]).await?;
        info!(plist = %path.display(), "Service installed");
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let path = self.plist_path();
        let _ = run_checked("launchctl", &["unload", "-w", &path.to_string_lossy()]).await;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Service {
                message: format!("cannot remove plist: {}", e),
            }),
        }
    }

    async fn start(&self) -> Result<()> {
        run_checked("launchctl", &["start", &self.label()]).await
    }

    async fn stop(&self) -> Result<()> {
        run_checked("launchctl", &["stop", &self.label()]).await
    }

    async fn restart(&self) -> Result<()> {
        let _ = self.stop().await;
        self.start().await
    }
}
