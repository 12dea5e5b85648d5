//! NebulaLink agent binary entry point.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nebula_core::constants::AGENT_LOG_FILE;
use nebula_core::{AgentIdentity, LogFormat, init_logging};

use nebula_agent::cli::{Cli, Command};
use nebula_agent::config::AgentConfig;
use nebula_agent::endpoint::EnvEndpointProvider;
use nebula_agent::metrics::SysinfoSampler;
use nebula_agent::service::platform_controller;
use nebula_agent::supervisor::Supervisor;

fn main() {
    // Usage errors exit 1, matching the failure exit code; help and
    // version remain exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Daemon mode logs to the agent log file; CLI verbs log to stderr.
    let log_file = cli.command.is_none().then_some(Path::new(AGENT_LOG_FILE));
    if let Err(e) = init_logging(cli.verbose.max(2), log_file, LogFormat::Text) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let config = match AgentConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "Configuration error");
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    let exit = runtime.block_on(run(cli, config));
    std::process::exit(exit);
}

async fn run(cli: Cli, config: Arc<AgentConfig>) -> i32 {
    let agent_name = cli.agent_name().to_string();
    let controller = platform_controller(&config, &agent_name);

    if let Some(command) = &cli.command {
        let result = match command {
            Command::Install { .. } => controller.install().await,
            Command::Uninstall { .. } => controller.uninstall().await,
            Command::Start { .. } => controller.start().await,
            Command::Stop { .. } => controller.stop().await,
        };
        return match result {
            Ok(()) => {
                println!("ok");
                0
            }
            Err(e) => {
                eprintln!("error: {}", e);
                1
            }
        };
    }

    // Daemon mode.
    let identity = AgentIdentity::derive(agent_name);
    info!(
        agent_id = %identity.id,
        agent_name = %identity.name,
        os = %identity.os,
        version = env!("CARGO_PKG_VERSION"),
        "NebulaLink agent starting"
    );

    if let Err(e) = std::fs::create_dir_all(config.shared_folder()) {
        error!(error = %e, "Cannot create shared folder");
        return 1;
    }

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let supervisor = Supervisor::new(
        config,
        identity,
        Arc::new(SysinfoSampler),
        Arc::new(EnvEndpointProvider::from_env()),
        Arc::from(controller),
    );
    supervisor.run(shutdown).await;
    info!("Agent stopped");
    0
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Termination signal received");
        shutdown.cancel();
    });
}
