//! NebulaLink master binary entry point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use nebula_master::api::{self, AppState};
use nebula_master::cli::Cli;
use nebula_master::handlers;
use nebula_master::hub::Hub;
use nebula_master::sse::SseHub;
use nebula_master::status;
use nebula_master::transfer::{ConnectionDirectory, FrameSender, TransferManager};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = nebula_core::init_logging(
        cli.verbose.max(2),
        cli.log_file.as_deref(),
        cli.log_format.into(),
    ) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "nebula-master starting");

    let hub = Hub::new(SseHub::new());
    let sender: Arc<dyn FrameSender> = hub.clone();
    let dir: Arc<dyn ConnectionDirectory> = hub.clone();
    let transfer = TransferManager::new(sender, dir);

    let pending = Arc::new(StdMutex::new(HashMap::new()));
    handlers::register(&hub, Arc::clone(&pending));
    status::register(&hub, Arc::clone(&transfer));

    let state = AppState {
        hub,
        transfer,
        pending,
        started: Instant::now(),
    };
    let router = api::router(state);

    let addr = cli.socket_addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "Listening");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Termination signal received");
        })
        .await
    {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }

    info!("Master stopped");
}
