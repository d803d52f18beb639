//! Python Executor service
//!
//! Serves `POST /execute` until interrupted.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use python_executor::{config::Args, server, Supervisor, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("python_executor=info,tower_http=info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let supervisor = Arc::new(Supervisor::new(args.supervisor_config()));

    let runtime = supervisor.runtime();
    match runtime.version() {
        Some(version) => info!(%version, python = %args.python.display(), "interpreter found"),
        None => warn!(
            python = %args.python.display(),
            "interpreter not available, every request will fail"
        ),
    }

    let config = args.server_config();
    info!(
        version = VERSION,
        default_timeout_secs = args.default_timeout,
        max_concurrent = supervisor.config().max_concurrent,
        "starting python-executor"
    );

    server::serve(&config, supervisor, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
