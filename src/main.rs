use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hopgate::config::{Cli, Mode, ProxyConfig, ReverseConfig};
use hopgate::connection::active_tunnels;
use hopgate::server::serve;

const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hopgate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();

    match args.mode {
        Mode::Forward(args) => {
            let config = ProxyConfig::from_args(args)?;
            let listener = TcpListener::bind(config.listen_addr).await?;
            info!("Forward proxy listening on http://{}", config.listen_addr);
            if let Some(upstream) = &config.upstream {
                info!("Chaining through upstream {upstream}");
            }
            if config.users.is_empty() {
                warn!("No --user configured, the proxy is open to anyone who can reach it");
            } else {
                info!("{} user(s) configured", config.users.len());
            }
            if config.default_valve.is_active() {
                info!("Default bandwidth: {}", config.default_valve);
            }
            run_until_shutdown(serve(listener, Arc::new(config.build()))).await;
        }
        Mode::Reverse(args) => {
            let config = ReverseConfig::from_args(args)?;
            let proxy = config.build()?;
            let listener = TcpListener::bind(config.listen_addr).await?;
            info!(
                "Reverse proxy listening on http://{} -> {} (fix-host: {}, fix-redirect: {})",
                config.listen_addr, config.target, config.fix_host, config.fix_redirect
            );
            run_until_shutdown(serve(listener, Arc::new(proxy))).await;
        }
    }

    Ok(())
}

async fn run_until_shutdown(server: impl Future<Output = ()>) {
    tokio::select! {
        _ = server => {
            warn!("Server loop terminated");
        }
        _ = shutdown() => {
            info!("Server shutdown complete");
        }
    }
}

/// Resolves after Ctrl-C, once open tunnels have drained or the grace
/// period ran out.
async fn shutdown() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
        return;
    }
    info!("Shutdown signal received");

    let active = active_tunnels();
    if active == 0 {
        return;
    }
    info!("Waiting for {active} tunnel(s) to close...");

    for i in 1..=SHUTDOWN_GRACE_SECS {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = active_tunnels();
        if remaining == 0 {
            info!("All tunnels closed gracefully");
            return;
        }
        if i % 5 == 0 {
            info!("Still waiting for {remaining} tunnel(s)... ({i}/{SHUTDOWN_GRACE_SECS}s)");
        }
    }

    warn!(
        "Forced shutdown with {} tunnel(s) still active",
        active_tunnels()
    );
}
