use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use callcenter_dispatch_core::logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
use callcenter_dispatch_core::DispatcherBuilder;
use callcenter_dispatch_server::{router, Args};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?, "dispatch-server")
        .with_log_file(&args.log_file);
    if args.json_logs {
        logging = logging.with_json();
    }
    let _log_guard = setup_logging(logging)?;
    log_welcome("dispatch-server", env!("CARGO_PKG_VERSION"));

    let system = DispatcherBuilder::new()
        .with_config_file(&args.config)
        .with_cdr_file(&args.cdr_file)
        .with_monitor_interval(Duration::from_secs(args.monitor_interval))
        .build()
        .context("failed to build dispatcher")?;
    system.dispatcher.start_thread_pool();

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🌐 Dispatch server listening on {}", addr);

    let served = axum::serve(listener, router(system.dispatcher.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("🛑 Shutting down, stopping operator pool");
    system.dispatcher.stop_thread_pool();
    tokio::task::spawn_blocking(move || drop(system))
        .await
        .context("failed to release dispatcher")?;

    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
