mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use libhealer::Controller;
use log::{error, info};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let cfg = cli.command.into_config().context("invalid configuration")?;
    info!(
        "[rkh] keeping {} workers of {} under {} on {:?}",
        cfg.workers,
        cfg.program.display(),
        cfg.namespace,
        cfg.xline_config.endpoints
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let controller = Controller::from_config(&cfg);
    if let Err(e) = controller.run(shutdown).await {
        error!("[rkh] stopped: {e:#}");
        return Err(e);
    }
    info!("[rkh] stopped");
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        res = tokio::signal::ctrl_c() => {
                            if let Err(e) = res {
                                error!("failed to listen for ctrl_c: {e:?}");
                                return;
                            }
                            info!("Received CTRL-C, shutting down...");
                        }
                        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                    }
                    token.cancel();
                    return;
                }
                Err(e) => error!("failed to listen for SIGTERM: {e:?}"),
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e:?}");
            return;
        }
        info!("Received CTRL-C, shutting down...");
        token.cancel();
    });
}
