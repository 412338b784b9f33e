use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Args;
use common::config::Configuration;
use router::{AdminState, run_admin_server};

use super::connect;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on, overrides admin.bind
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

pub async fn serve(config: Configuration, args: ServeArgs) -> Result<()> {
    let addr = match args.bind {
        Some(addr) => addr,
        None => config
            .admin
            .bind
            .parse()
            .with_context(|| format!("Invalid admin bind address '{}'", config.admin.bind))?,
    };

    if config.admin.admin_key.is_none() {
        log::warn!("No admin key configured, maintenance routes will answer 403");
    }

    let orchestrator = connect(&config).await?;
    let store = orchestrator.store().clone();
    let state = AdminState::new(orchestrator, &config);

    run_admin_server(addr, state, async {
        if let Err(e) = wait_for_shutdown_signal().await {
            log::error!("Shutdown signal handler failed: {e}");
        }
    })
    .await?;

    store.close().await;
    Ok(())
}
