use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use treemirror::cli::DaemonOpts;
use treemirror::config::Settings;
use treemirror::{logging, server, RemoteTools, SshTools, SyncJobManager};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::resolve(DaemonOpts::parse()).context("invalid configuration")?;
    logging::init(settings.log_level, settings.log_format)?;

    let bind = settings.bind_addr();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(
        data_path = %settings.data_path.display(),
        remote = %settings.remote.login(),
        remote_port = settings.remote.port,
        "starting treemirror"
    );

    let tools: Arc<dyn RemoteTools> = Arc::new(SshTools::new(settings.remote.clone()));
    let manager = Arc::new(SyncJobManager::new(
        settings.data_path.clone(),
        tools,
        settings.grace_period,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));
    server::serve(listener, Arc::clone(&manager), shutdown).await;

    let drain = settings.grace_period + Duration::from_secs(1);
    if !manager.shutdown(drain).await {
        warn!("exiting with transfers still running");
    }
    info!("stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot watch SIGTERM, only Ctrl-C stops the service");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C");
    }
    shutdown.cancel();
}
