use clap::Parser;
use render_pool::{load_config, setup_logging, ChromiumLauncher, Cli, CliRunner};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logging(args.verbose)?;

    info!("Starting render-pool v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(2);
        }
    };

    let launcher = Arc::new(ChromiumLauncher::new(config.clone()));
    let runner = CliRunner::new(config, launcher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    if let Err(e) = runner.run(args.command, shutdown_rx).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("render-pool stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down...");
        shutdown_tx.send_replace(true);
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use signal::unix::{signal as unix_signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        unix_signal(SignalKind::interrupt()),
        unix_signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            error!("Failed to install signal handlers, falling back to ctrl-c");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
    info!("Received ctrl-c");
}
